use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use lookout::{
    config::{AgentConfig, read_config_file},
    context::AppContext,
    supervisor::Supervisor,
    util::get_config_path,
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Host and nginx telemetry agent")]
struct Args {
    /// Config file, defaults to $LOOKOUT_CONFIG or /etc/lookout/lookout.json
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Log everything down to trace
    #[arg(long)]
    verbose: bool,

    /// Run a single tick and print the object tree as JSON
    #[arg(long)]
    once: bool,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("lookout", level),
        ("lookout_agent", level),
    ]);
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

fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    let path = args.file.clone().unwrap_or_else(get_config_path);
    if args.file.is_none() && !path.exists() {
        // logging is not up yet
        eprintln!("no config at {}, using defaults", path.display());
        return Ok(AgentConfig::default());
    }
    read_config_file(&path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = load_config(&args)?;
    let level = if args.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::from_str(&config.log.level).unwrap_or(LevelFilter::INFO)
    };
    init(level);
    trace!("started with args: {args:?}");

    let context = AppContext::new(config)?;
    info!("environment: {}", context.environment);
    let mut supervisor = Supervisor::new(context);

    if args.once {
        let result = supervisor.tick().await;
        let tree = supervisor.tree();
        supervisor.shutdown().await;
        result?;

        let tree = serde_json::to_string_pretty(&tree).context("failed to render object tree")?;
        println!("{tree}");
        return Ok(());
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = supervisor.run(shutdown).await {
        error!("stopping agent: {e}");
        return Err(e.into());
    }

    Ok(())
}
