use std::str;

use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::HashKind;

pub const DEFAULT_CATALOG_URL: &str = "https://api.ipsw.me/v4";

const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog returned HTTP {0}: {1}")]
    BadHttpResponse(StatusCode, String),
    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Failed to parse catalog response: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// A single firmware version for one device, as listed by the catalog.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FirmwareRecord {
    /// Device model identifier (eg. `iPhone14,2`)
    pub identifier: String,
    /// Human-readable OS version (eg. `17.4.1`)
    pub version: String,
    /// Build ID (eg. `21E236`)
    #[serde(rename = "buildid")]
    pub build_id: String,
    /// Download URL of the firmware container
    pub url: String,
    #[serde(default)]
    pub sha1sum: Option<String>,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// Container size in bytes
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub releasedate: Option<String>,
}

impl FirmwareRecord {
    /// All reference checksums supplied by the catalog. Empty strings are
    /// treated as missing.
    pub fn reference_hashes(&self) -> Vec<(HashKind, &str)> {
        [
            (HashKind::Sha1, self.sha1sum.as_deref()),
            (HashKind::Md5, self.md5sum.as_deref()),
        ]
            .iter()
            .filter_map(|(k, v)| match v {
                Some(s) if !s.is_empty() => Some((*k, *s)),
                _ => None,
            })
            .collect()
    }

    /// File name of the firmware container on disk.
    pub fn container_name(&self) -> String {
        format!("{}-{}.ipsw", self.identifier, self.version)
    }
}

/// Catalog listing for one device model.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub firmwares: Vec<FirmwareRecord>,
}

impl CatalogResponse {
    /// Keep only the `n` most recent firmwares. The catalog lists firmwares
    /// newest first, so this keeps the head of the list.
    pub fn select_latest(&mut self, n: usize) {
        self.firmwares.truncate(n);
    }

    /// Device identifier of this listing. Falls back to the first firmware's
    /// identifier if the top-level field is absent.
    pub fn device_identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
            .or_else(|| self.firmwares.first().map(|f| f.identifier.as_str()))
    }
}

/// Client for the firmware catalog service.
#[derive(Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// List all firmware containers available for a device model.
    pub async fn device(&self, model: &str) -> Result<CatalogResponse, CatalogError> {
        let url = format!("{}/device/{}", self.base_url, model);
        debug!("Catalog URL: {url}");

        let r = self.client.get(&url)
            .query(&[("type", "ipsw")])
            .send()
            .await?;
        let status = r.status();
        let data = r.bytes().await?;

        if status != StatusCode::OK {
            let body = str::from_utf8(&data).unwrap_or(NON_UTF8_MSG);
            return Err(CatalogError::BadHttpResponse(status, body.to_owned()));
        }

        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const SAMPLE: &str = r#"{
        "name": "iPhone 13 Pro",
        "identifier": "iPhone14,2",
        "firmwares": [
            {
                "identifier": "iPhone14,2",
                "version": "17.4.1",
                "buildid": "21E236",
                "url": "https://updates.cdn-apple.com/a.ipsw",
                "sha1sum": "2c4b4e8e1c0e8a41b2d7a1a3e8f5d8e2a6c0b1f3",
                "md5sum": "",
                "filesize": 7000000000,
                "releasedate": "2024-03-21T17:00:00Z",
                "signed": true
            },
            {
                "identifier": "iPhone14,2",
                "version": "17.4",
                "buildid": "21E219",
                "url": "https://updates.cdn-apple.com/b.ipsw"
            },
            {
                "identifier": "iPhone14,2",
                "version": "17.3.1",
                "buildid": "21D61",
                "url": "https://updates.cdn-apple.com/c.ipsw",
                "md5sum": "d41d8cd98f00b204e9800998ecf8427e"
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_select() {
        let mut response: CatalogResponse = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(response.device_identifier(), Some("iPhone14,2"));
        assert_eq!(response.firmwares.len(), 3);

        let first = &response.firmwares[0];
        assert_eq!(first.build_id, "21E236");
        assert_eq!(first.container_name(), "iPhone14,2-17.4.1.ipsw");
        assert_eq!(
            first.reference_hashes(),
            vec![(HashKind::Sha1, "2c4b4e8e1c0e8a41b2d7a1a3e8f5d8e2a6c0b1f3")],
        );
        assert!(response.firmwares[1].reference_hashes().is_empty());
        assert_eq!(response.firmwares[2].reference_hashes()[0].0, HashKind::Md5);

        response.select_latest(2);
        let versions: Vec<_> = response.firmwares.iter().map(|f| f.version.as_str()).collect();
        assert_eq!(versions, ["17.4.1", "17.4"]);

        response.select_latest(5);
        assert_eq!(response.firmwares.len(), 2);
    }

    #[tokio::test]
    async fn test_device() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/device/iPhone14,2"))
            .and(query_param("type", "ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/device/iPhone0,0"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not found"))
            .mount(&server)
            .await;

        let client = CatalogClient::new(reqwest::Client::new(), &format!("{}/", server.uri()));

        let response = client.device("iPhone14,2").await.unwrap();
        assert_eq!(response.firmwares.len(), 3);

        let result = client.device("iPhone0,0").await;
        assert_matches!(result, Err(CatalogError::BadHttpResponse(s, b))
            if s == StatusCode::NOT_FOUND && b == "Not found");
    }
}
