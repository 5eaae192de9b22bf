//! Scheduler entry point: one billing task per invocation.

use std::process;

use billing_service::config::BillingConfig;
use billing_service::services::{DeliveryStatus, GenerationResult, GenerationSummary};
use billing_service::startup::AppState;
use clap::{Parser, Subcommand, ValueEnum};
use service_core::observability::init_tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Weekly billing jobs.
#[derive(Parser)]
#[command(name = "billing-job", version, about = "Weekly billing jobs")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Skip running migrations before the job
    #[arg(long, global = true)]
    skip_migrations: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current and previous billing periods
    Periods,
    /// Generate invoices for the week that just closed
    GenerateWeekly,
    /// Send every draft invoice the gateway has not seen, with notifications
    SendPending,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = BillingConfig::load()?;
    init_tracing(
        "billing-job",
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    let state = AppState::from_config(&config, !cli.skip_migrations).await?;
    let json = cli.output == OutputFormat::Json;

    match cli.command {
        Commands::Periods => {
            let calculator = state.generator.calculator();
            let now = chrono::Utc::now();
            let current = calculator.current_period(now);
            let previous = calculator.previous_period(now);
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "timezone": calculator.timezone().name(),
                        "current": current,
                        "previous": previous,
                    })
                );
            } else {
                println!("timezone: {}", calculator.timezone().name());
                println!("current:  {} .. {}", current.start, current.end);
                println!("previous: {} .. {}", previous.start, previous.end);
            }
        }
        Commands::GenerateWeekly => {
            let results = state.generator.generate_weekly_invoices().await?;
            let summary = GenerationSummary::from_results(&results);
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "summary": summary, "results": results })
                );
            } else {
                for result in &results {
                    match result {
                        GenerationResult::Generated {
                            client_name,
                            invoice_number,
                            amount,
                            ..
                        } => println!("generated {} for {}: {}", invoice_number, client_name, amount),
                        GenerationResult::Skipped {
                            client_name, reason, ..
                        } => println!("skipped   {}: {}", client_name, reason),
                        GenerationResult::Failed {
                            client_name, error, ..
                        } => println!("failed    {}: {}", client_name, error),
                    }
                }
                println!(
                    "{} generated, {} skipped, {} failed",
                    summary.generated, summary.skipped, summary.failed
                );
            }
            if summary.failed > 0 {
                anyhow::bail!("{} client(s) failed", summary.failed);
            }
        }
        Commands::SendPending => {
            let results = state
                .dispatcher
                .send_all_pending_invoices_with_notifications()
                .await?;
            let failed = results
                .iter()
                .filter(|r| r.status == DeliveryStatus::Failed)
                .count();
            if json {
                println!("{}", serde_json::json!({ "results": results }));
            } else {
                for result in &results {
                    let status = match result.status {
                        DeliveryStatus::Sent => "sent",
                        DeliveryStatus::Failed => "failed",
                    };
                    println!(
                        "{:<6} {} {} {}",
                        status, result.invoice_number, result.client_name, result.amount
                    );
                }
                println!("{} sent, {} failed", results.len() - failed, failed);
            }
            if failed > 0 {
                anyhow::bail!("{} invoice(s) failed to send", failed);
            }
        }
    }

    Ok(())
}
