use anyhow::Context;
use bucket_trim::cli::{Cli, Commands};
use bucket_trim::config::TrimConfig;
use bucket_trim::logging::{init_logging, init_logging_simple};
use bucket_trim::simulate::{run_simulation, SimulationOptions, SimulationReport};
use clap::Parser;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Simulate {
            gateways,
            input,
            top,
            disconnect,
            json,
        } => {
            let config = load_config(&cli.config_dir)?;
            init_logging(&config.logging);

            let changes = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    read_lines(file).await?
                }
                None => read_lines(tokio::io::stdin()).await?,
            };

            let options = SimulationOptions {
                gateways: *gateways,
                top: *top,
                disconnect: *disconnect,
            };
            info!(
                "Simulating {} gateways over {} bucket changes",
                options.gateways,
                changes.len()
            );
            let report = run_simulation(config, &options, changes).await?;
            print_report(&report, *json)?;
        }
        Commands::Config => {
            init_logging_simple();
            let config = load_config(&cli.config_dir)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(config_dir: &Path) -> anyhow::Result<TrimConfig> {
    let config = TrimConfig::load_from(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }
    Ok(config)
}

async fn read_lines<R>(reader: R) -> anyhow::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    Ok(out)
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        let counters: Vec<_> = report
            .counters
            .iter()
            .map(|c| serde_json::json!({ "bucket": c.bucket, "count": c.count }))
            .collect();
        let out = serde_json::json!({
            "changes": report.changes,
            "gateways": report.gateways,
            "watching": report.watching,
            "counters": counters,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} changes over {} gateways ({} watching)",
        report.changes, report.gateways, report.watching
    );
    println!("{:<48} {:>10}", "BUCKET", "COUNT");
    for counter in &report.counters {
        println!("{:<48} {:>10}", counter.bucket, counter.count);
    }
    Ok(())
}
