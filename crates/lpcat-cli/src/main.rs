use anyhow::Result;
use clap::{Parser, Subcommand};
use lpcat_reconcile::{page_id_for, Reconciler};
use lpcat_sync::{load_reconcile_rules, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lpcat-cli")]
#[command(about = "Landing page catalogue reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation batch over the configured streams.
    Sync,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Print the normalized key and page id for each URL.
    Normalize {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lpcat=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = lpcat_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} catalogue={} eligible={} annotated={} gaps={} dry_run={} reports={}",
                summary.run_id,
                summary.catalogue_records,
                summary.eligible,
                summary.annotated,
                summary.gaps.total_gaps,
                summary.dry_run,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", lpcat_sync::report_daily_markdown(runs, &config.reports_dir)?);
        }
        Commands::Normalize { urls } => {
            let config = SyncConfig::from_env();
            let rules = load_reconcile_rules(&config.workspace_root).await?;
            rules.reconcile.validate()?;
            let reconciler = Reconciler::new(rules.reconcile);
            for url in urls {
                let normalized = reconciler.normalize(&url);
                let marker = if normalized.malformed { " [malformed]" } else { "" };
                println!("{url}\t{}\t{}{marker}", normalized.key, page_id_for(&normalized.key));
            }
        }
        Commands::Serve => lpcat_web::serve_from_env().await?,
    }

    Ok(())
}
