//! Entrypoint of the influxdb_proxy binary.

use clap::Parser;
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backend::{NodeConfig, ProxyConfig};
use cluster::InfluxCluster;
use influxdb_proxy::http::{serve, HttpDelegate};

#[derive(Debug, Parser)]
#[clap(
    name = "influxdb-proxy",
    version,
    about = "Cluster proxy for InfluxDB 1.x backends"
)]
struct Config {
    /// Proxy config file.
    #[clap(short = 'c', long = "config", default_value = "proxy.json")]
    config_file: PathBuf,

    /// Directory for the per-backend spill files, overriding NODE.data_dir.
    #[clap(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Log filter directives, e.g. `info` or `backend=debug`.
    #[clap(long = "log-filter", env = "LOG_FILTER", default_value = "info")]
    log_filter: String,
}

fn main() -> ExitCode {
    let config = Config::parse();

    let proxy_config = match ProxyConfig::from_path(&config.config_file) {
        Ok(proxy_config) => proxy_config,
        Err(e) => {
            eprintln!("config source load failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.log_filter, &proxy_config.node) {
        eprintln!("unable to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "unable to start the tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(config, proxy_config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "proxy exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Logs to stdout, or to `NODE.log_path` when configured. Rotation is an
/// external concern.
fn init_logging(log_filter: &str, node: &NodeConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if node.log_path.is_empty() {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&node.log_path)?;
        builder
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

async fn run(
    config: Config,
    proxy_config: ProxyConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let node = proxy_config.node.clone();
    if node.https_enabled {
        // The TLS listener lives in front of the proxy; terminate there.
        return Err("https_enabled is not supported, terminate TLS in front of the proxy".into());
    }

    let data_dir = config
        .data_dir
        .unwrap_or_else(|| PathBuf::from(&node.data_dir));
    std::fs::create_dir_all(&data_dir)?;
    info!(config = %config.config_file.display(), data_dir = %data_dir.display(), "starting proxy");

    let cluster = InfluxCluster::new(&proxy_config, &data_dir)?;
    let delegate = Arc::new(HttpDelegate::new(
        cluster.clone(),
        node.clone(),
        config.config_file.clone(),
    ));

    let result = serve(
        delegate,
        &node.listen_addr,
        Duration::from_millis(node.idle_timeout),
    )
    .await;

    info!("draining backends");
    cluster.close().await;
    result.map_err(Into::into)
}
