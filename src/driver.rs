use anyhow::{anyhow, Context, Result};
use ipcclib::{catalog::CatalogClient, pipeline::Pipeline, vcs::Git};
use log::{error, info, warn};

/// Walks the device list, running the pipeline for each device's most recent
/// firmware versions.
pub struct Driver {
    catalog: CatalogClient,
    pipeline: Pipeline,
    versions_per_device: usize,
    git: Option<Git>,
}

impl Driver {
    pub fn new(
        catalog: CatalogClient,
        pipeline: Pipeline,
        versions_per_device: usize,
        git: Option<Git>,
    ) -> Self {
        Self {
            catalog,
            pipeline,
            versions_per_device,
            git,
        }
    }

    /// Process each model in turn. A model that fails is logged and skipped.
    /// Returns the total number of newly processed versions.
    pub async fn run(&self, models: &[String]) -> usize {
        let mut total = 0;

        for model in models {
            match self.fetch_and_bake(model).await {
                Ok(n) => total += n,
                Err(e) => error!("{model}: {e:?}"),
            }
        }

        total
    }

    /// Fetch the catalog listing for `model` and process its most recent
    /// versions.
    pub async fn fetch_and_bake(&self, model: &str) -> Result<usize> {
        let mut response = self.catalog.device(model).await
            .with_context(|| format!("Failed to fetch firmware list for {model}"))?;

        if response.firmwares.is_empty() {
            warn!("No firmwares found for {model}");
            return Ok(0);
        }

        response.select_latest(self.versions_per_device);

        let identifier = response.device_identifier()
            .ok_or_else(|| anyhow!("Firmware list for {model} has no device identifier"))?
            .to_owned();

        info!("{model}: {} versions selected", response.firmwares.len());

        if let Some(git) = &self.git {
            git.restore(&identifier).await
                .with_context(|| format!("Failed to restore {identifier} from git"))?;
        }

        let processed = self.pipeline.run(&response).await;
        info!("{identifier}: processed {processed} new versions");

        if let Some(git) = &self.git {
            if processed > 0 {
                git.snapshot(&identifier).await
                    .with_context(|| format!("Failed to commit {identifier}"))?;
            } else {
                git.discard(&identifier).await
                    .with_context(|| format!("Failed to discard {identifier}"))?;
            }
        }

        Ok(processed)
    }
}
