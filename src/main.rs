//! sitegate: multi-site HTTP server.
//!
//! ```text
//! sitegate --sites ./sites [--settings ./sitegate.toml]
//! sitegate --config ./site.json
//! ```
//!
//! SIGHUP reloads the site configuration in-process; SIGINT or SIGTERM
//! stop the server after in-flight requests finish.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};

use sitegate::config::{load_settings, ServerSettings, SiteSource};
use sitegate::lifecycle::Supervisor;
use sitegate::observability::{logging::init_logging, metrics::init_metrics};
use sitegate::plugins::{AuthPlugin, Plugin};

#[derive(Debug, Parser)]
#[command(name = "sitegate", version, about = "Multi-site HTTP server")]
#[command(group(ArgGroup::new("source").required(true).args(["sites", "config"])))]
struct Args {
    /// Directory of site JSON files.
    #[arg(long, value_name = "DIR")]
    sites: Option<PathBuf>,

    /// A single site JSON file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server settings (TOML).
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,
}

fn bundled_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(AuthPlugin::new())]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => load_settings(path)?,
        None => ServerSettings::default(),
    };
    init_logging(&settings.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sitegate starting");

    if settings.metrics.enabled {
        match settings.metrics.address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %settings.metrics.address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let source = match (args.sites, args.config) {
        (Some(dir), _) => SiteSource::Directory(dir),
        (None, Some(file)) => SiteSource::File(file),
        (None, None) => return Err("one of --sites or --config is required".into()),
    };

    Supervisor::new(source, settings)
        .with_plugins(bundled_plugins)
        .run()
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
