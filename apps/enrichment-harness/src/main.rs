mod cli;
mod scenario;
mod telemetry;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use cli::Cli;
use scenario::Scenario;

// Steps rely on the stream worker running between them, which a single
// scheduler thread guarantees.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("initialising logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let raw = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading {}", cli.scenario.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", cli.scenario.display()))?;

    let summary = scenario::replay(scenario).await?;
    let output = if cli.pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{output}");
    Ok(())
}
