use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sspl_agent::{
    ModuleCatalog, bootstrap,
    broker::{Transport, http::HttpTransport, memory::MemoryTransport},
    config::{Config, read_config_file},
    util::{get_config_path, get_default_config_path, get_log_level},
};
use tracing::{error, info, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status for an unusable configuration (`EX_USAGE`)
const EXIT_CONFIG: u8 = 64;

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Args {
    /// Config file (falls back to $SSPL_CONFIG, then /etc/sspl.json)
    #[arg(short, long)]
    file: Option<String>,

    /// Relay through an in-process broker instead of the configured hosts
    #[arg(long)]
    loopback: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let level = get_log_level();
    let filter = filter::Targets::new().with_target("sspl_agent", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn load_config(args: &Args) -> Option<Config> {
    let path = args
        .file
        .clone()
        .or_else(get_config_path)
        .unwrap_or_else(|| get_default_config_path().to_string());

    match read_config_file(&path) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("{path}: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let Some(config) = load_config(&args) else {
        return Ok(ExitCode::from(EXIT_CONFIG));
    };

    let transport: Arc<dyn Transport> = if args.loopback {
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(HttpTransport::new())
    };

    let scheduler = match bootstrap(&config, transport, &ModuleCatalog::builtin()) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let handle = scheduler.start();
    info!("agent running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;

    info!("stopping");
    handle.shutdown();
    handle.join().await;

    Ok(ExitCode::SUCCESS)
}
