//! xproofd - cluster control-plane daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use xpd_server::config::{ConfigLoader, XpdConfig};
use xpd_server::maintenance::run_maintenance_loop;
use xpd_server::tcp::run_tcp_accept_loop;
use xpd_server::DaemonState;
use xpd_utils::{LogConfig, LogOutput, Result, XpdError};

/// xproofd - launches and relays analysis sessions for a cluster
#[derive(Parser, Debug)]
#[command(name = "xproofd", author, version, about, long_about = None)]
struct Args {
    /// Directive file (defaults to the user config file when present)
    #[arg(long, short = 'c', env = "XPD_CONFIG")]
    config: Option<PathBuf>,

    /// Listening port, overrides `xpd.port`
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Host name used to resolve `if` qualifiers
    #[arg(long)]
    host: Option<String>,

    /// Log filter, e.g. `xpd_server=debug`
    #[arg(long)]
    log: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, short = 'f', default_value_t = false)]
    foreground: bool,
}

fn load_config(args: &Args) -> Result<XpdConfig> {
    let host = args.host.clone().unwrap_or_else(xpd_utils::local_hostname);
    let path = args.config.clone().or_else(|| {
        let default = xpd_utils::config_file();
        default.exists().then_some(default)
    });
    let mut config = match path {
        Some(path) => ConfigLoader::load_from_path(&path, &host)?,
        None => {
            warn!("no config file: running with defaults");
            XpdConfig {
                host,
                ..XpdConfig::default()
            }
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

async fn wait_for_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    info!(
        "xproofd starting on {}:{} (role {:?})",
        config.host, config.port, config.role
    );

    let port = config.port;
    let state = Arc::new(DaemonState::builder(config).build()?);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| XpdError::connection(format!("cannot bind port {}: {}", port, e)))?;

    let maintenance = tokio::spawn(run_maintenance_loop(Arc::clone(&state)));
    let accept = tokio::spawn(run_tcp_accept_loop(listener, Arc::clone(&state)));

    wait_for_signal().await?;
    info!("shutdown requested");
    state.shutdown();
    state.supervisor.kill_all();

    let _ = accept.await;
    let _ = maintenance.await;
    state.broadcaster.pool().clear().await;
    info!("xproofd stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log = if args.foreground {
        LogConfig {
            output: LogOutput::Stderr,
            ..LogConfig::server()
        }
    } else {
        LogConfig::server()
    };
    let log = match &args.log {
        Some(filter) => log.with_filter(filter.clone()),
        None => log,
    };
    xpd_utils::init_logging_with_config(log)?;

    run_daemon(args).await
}
