use std::{
    io::{self, Stderr},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use progresslib::{ProgressBar, ProgressDrawMode};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_stream::StreamExt;

use crate::{
    catalog::FirmwareRecord,
    file::delete_if_exists,
    hash::{self, HashError},
};

/// Firmware containers are several GiB, so requests get a generous timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1000);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to download {url}: HTTP {status}")]
    BadHttpResponse {
        url: String,
        status: StatusCode,
    },
    #[error("Network error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Failed to write {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Could not verify download: {0}")]
    Hash(#[from] HashError),
}

/// Downloads firmware containers, reusing verified files from earlier runs.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    timeout: Duration,
    progress: ProgressDrawMode,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            progress: ProgressDrawMode::Append,
        }
    }

    /// Set the timeout for a whole request, including the body transfer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how download progress is drawn on stderr.
    pub fn progress(mut self, mode: ProgressDrawMode) -> Self {
        self.progress = mode;
        self
    }

    /// Download the firmware container for `record` into `directory` and
    /// return its path. If a file already exists there and matches the
    /// catalog checksums, it is used as-is. Otherwise it is deleted and
    /// downloaded again.
    ///
    /// A checksum mismatch after the download is only logged. Some catalog
    /// checksums are wrong, and the extraction step fails anyway if the file
    /// is actually corrupt.
    pub async fn fetch(&self, record: &FirmwareRecord, directory: &Path) -> Result<PathBuf, DownloadError> {
        let path = directory.join(record.container_name());

        if path.exists() {
            if hash::matches_any(&path, record).await? {
                info!("Using existing download: {path:?}");
                return Ok(path);
            }

            info!("Existing download does not match checksums, downloading again: {path:?}");
            delete_if_exists(&path).await
                .map_err(|e| DownloadError::Io(path.clone(), e))?;
        }

        if let Err(e) = self.stream_to_file(record, &path).await {
            // A request that never got a success status has not created the
            // file, so there is nothing to remove in that case
            if !matches!(e, DownloadError::BadHttpResponse { .. }) {
                if let Err(de) = delete_if_exists(&path).await {
                    warn!("Failed to delete partial download {path:?}: {de}");
                }
            }
            return Err(e);
        }

        if !hash::matches_any(&path, record).await? {
            warn!("Checksum mismatch for {path:?}");
        }

        Ok(path)
    }

    async fn stream_to_file(&self, record: &FirmwareRecord, path: &Path) -> Result<(), DownloadError> {
        info!("Downloading {} to {path:?}", record.url);

        let r = self.client.get(&record.url)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = r.status();

        if !status.is_success() {
            return Err(DownloadError::BadHttpResponse {
                url: record.url.clone(),
                status,
            });
        }

        let len = r.content_length().filter(|n| *n > 0);
        debug!("Content length: {len:?}");

        let mut file = File::create(path).await
            .map_err(|e| DownloadError::Io(path.to_owned(), e))?;
        let mut bar = self.progress_bar(path, len);
        let mut stream = r.bytes_stream();

        while let Some(data) = stream.next().await {
            let data = data?;

            file.write_all(&data).await
                .map_err(|e| DownloadError::Io(path.to_owned(), e))?;

            // Progress output is best effort
            let _ = bar.advance(data.len() as u64);
        }

        file.flush().await
            .map_err(|e| DownloadError::Io(path.to_owned(), e))?;

        Ok(())
    }

    fn progress_bar(&self, path: &Path, len: Option<u64>) -> ProgressBar<Stderr> {
        let label = path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut bar = ProgressBar::new(io::stderr(), label, len);
        bar.set_mode(Some(self.progress));
        bar
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::{io::AsyncReadExt, net::TcpListener};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::testutil::firmware_at;

    const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    fn downloader() -> Downloader {
        Downloader::new(reqwest::Client::new()).progress(ProgressDrawMode::None)
    }

    #[tokio::test]
    async fn test_download_and_reuse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut record = firmware_at("iPhone1,1", "1.0", &format!("{}/a.ipsw", server.uri()));
        record.sha1sum = Some(ABC_SHA1.to_owned());

        let path = downloader().fetch(&record, dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("iPhone1,1-1.0.ipsw"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        // Verified file is not downloaded again
        let again = downloader().fetch(&record, dir.path()).await.unwrap();
        assert_eq!(again, path);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_replaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut record = firmware_at("iPhone1,1", "1.0", &format!("{}/a.ipsw", server.uri()));
        record.sha1sum = Some(ABC_SHA1.to_owned());
        std::fs::write(dir.path().join(record.container_name()), b"ab").unwrap();

        let path = downloader().fetch(&record, dir.path()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut record = firmware_at("iPhone1,1", "1.0", &format!("{}/a.ipsw", server.uri()));
        record.md5sum = Some("0123".to_owned());

        let path = downloader().fetch(&record, dir.path()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let record = firmware_at("iPhone1,1", "1.0", &format!("{}/a.ipsw", server.uri()));

        let result = downloader().fetch(&record, dir.path()).await;
        assert_matches!(result, Err(DownloadError::BadHttpResponse { status, .. })
            if status == StatusCode::NOT_FOUND);
        assert!(!dir.path().join(record.container_name()).exists());
    }

    #[tokio::test]
    async fn test_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on port 1
        let record = firmware_at("iPhone1,1", "1.0", "http://127.0.0.1:1/a.ipsw");

        let result = downloader().fetch(&record, dir.path()).await;
        assert_matches!(result, Err(DownloadError::RequestError(e)) if e.is_connect());
        assert!(!dir.path().join(record.container_name()).exists());
    }

    #[tokio::test]
    async fn test_truncated_body_removes_partial_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Promise more bytes than are sent, then close the connection
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "Connection closed before end of request");
                request.extend_from_slice(&buf[..n]);
            }

            socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\n\r\npartial data")
                .await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let record = firmware_at("iPhone1,1", "1.0", &format!("http://{addr}/a.ipsw"));

        let result = downloader().fetch(&record, dir.path()).await;
        assert_matches!(result, Err(DownloadError::RequestError(e)) if !e.is_connect());
        assert!(!dir.path().join(record.container_name()).exists());

        server.await.unwrap();
    }
}
