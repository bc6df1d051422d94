mod config;
mod devices;
mod driver;

use std::{
    fmt,
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{debug, info, warn};

use ipcclib::{
    catalog::CatalogClient,
    download::Downloader,
    extract::Extractor,
    ledger::Ledger,
    pipeline::Pipeline,
    tools::{CommandLegacyDecryptor, Ipsw, SevenZip},
    vcs::Git,
};
use progresslib::ProgressDrawMode;

use config::{load_config_file, Config};
use driver::Driver;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

/// Archive the carrier bundles shipped in iPhone and iPad firmware.
///
/// For each known device, the most recent firmware versions are downloaded,
/// the carrier bundles are extracted from the root filesystem image, and each
/// bundle is stored as a tarball alongside JSON metadata. Versions that were
/// already processed are skipped.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    /// Commit and push each device's output with git
    ///
    /// The output directory must be inside a git working tree. Before a device
    /// is processed, its committed metadata is restored. Afterwards, the
    /// device directory is committed and pushed if any version was newly
    /// processed, or deleted otherwise.
    #[arg(short, long)]
    git: bool,
    /// Set logging verbosity
    ///
    /// By default, informational messages are printed. If set to 'debug', the
    /// output of the external tools is printed too. This option overrides the
    /// RUST_LOG environment variable, which would otherwise be respected if
    /// this option was not passed.
    #[arg(value_enum, long)]
    loglevel: Option<LogLevel>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. A missing config
    /// file is not an error.
    #[arg(long, env = "IPCCDL_CONFIG")]
    config: Option<PathBuf>,
}

/// Warn about external tools that cannot be found. They are only needed for
/// some firmware, so this is not fatal.
fn check_tools(config: &Config) {
    for program in [config.seven_zip(), config.ipsw()] {
        match which::which(program) {
            Ok(p) => debug!("Found {:?} at {:?}", program, p),
            Err(e) => warn!("{:?} is not available: {}", program, e),
        }
    }

    if config.legacy_decryptor.is_none() {
        debug!("No legacy decryptor configured");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        std::env::set_var("RUST_LOG", format!("{}={},ipcclib={}", PKG_NAME, l, l));
    }

    env_logger::Builder::from_env(
        Env::default().default_filter_or(format!("{}=info,ipcclib=info", PKG_NAME)),
    ).init();

    debug!("Arguments: {:#?}", opts);

    let config = load_config_file(opts.config.as_deref())?;
    debug!("Config: {:#?}", config);

    check_tools(&config);

    let output_dir = config.output_dir();
    fs::create_dir_all(&output_dir)
        .context(format!("Could not create output directory: {:?}", output_dir))?;

    let client = reqwest::Client::builder()
        .build()
        .context("Could not initialize HTTP client")?;
    let progress = if config.progress() {
        ProgressDrawMode::Append
    } else {
        ProgressDrawMode::None
    };

    let ledger = Arc::new(Ledger::new());
    let extractor = Extractor::new(
        Arc::new(SevenZip::new(config.seven_zip())),
        Arc::new(Ipsw::new(config.ipsw())),
        Arc::new(CommandLegacyDecryptor::new(config.legacy_decryptor.clone())),
        ledger.clone(),
    ).progress(progress);
    let downloader = Downloader::new(client.clone())
        .timeout(config.download_timeout())
        .progress(progress);
    let pipeline = Pipeline::new(
        &output_dir,
        downloader,
        extractor,
        ledger,
        config.concurrency(),
    );

    let git = if opts.git {
        Some(Git::new(&output_dir)
            .remote(config.git_remote.clone())
            .branch(config.git_branch.clone()))
    } else {
        None
    };

    let driver = Driver::new(
        CatalogClient::new(client, config.catalog_url()),
        pipeline,
        config.versions_per_device(),
        git,
    );

    let processed = driver.run(&devices::models()).await;
    info!("Processed {} new firmware versions", processed);

    Ok(())
}
