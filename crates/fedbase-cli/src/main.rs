use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fedbase_core::{ExternalId, Generation, SeasonRange, FIRST_SEASON};
use fedbase_sync::{CrawlReport, SeasonStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fedbase-cli")]
#[command(about = "Federation registry crawl command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl club listings for a season range.
    CrawlClubs {
        #[arg(long, default_value_t = FIRST_SEASON)]
        first_year: i32,
        /// Defaults to the current season (September rollover).
        #[arg(long)]
        last_year: Option<i32>,
    },
    /// Crawl athlete listings, season by season, nested per discovered club.
    CrawlAthletes {
        #[arg(long, default_value_t = FIRST_SEASON)]
        first_year: i32,
        #[arg(long)]
        last_year: Option<i32>,
        /// Restrict the crawl to one club's raw external id.
        #[arg(long)]
        club: Option<String>,
        /// Generation of the --club id.
        #[arg(long, default_value = "legacy")]
        generation: String,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CrawlClubs {
            first_year,
            last_year,
        } => {
            let range = season_range(first_year, last_year)?;
            let report = fedbase_sync::crawl_clubs_from_env(range).await?;
            print_summary(&report);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::CrawlAthletes {
            first_year,
            last_year,
            club,
            generation,
        } => {
            let range = season_range(first_year, last_year)?;
            let scope = club
                .map(|raw| -> Result<ExternalId> {
                    let generation = Generation::parse(&generation)
                        .ok_or_else(|| anyhow!("unknown generation {generation:?}"))?;
                    Ok(ExternalId { raw, generation })
                })
                .transpose()?;
            let report = fedbase_sync::crawl_athletes_from_env(range, scope).await?;
            print_summary(&report);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            fedbase_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn season_range(first: i32, last: Option<i32>) -> Result<SeasonRange> {
    Ok(SeasonRange::new(first, last, Utc::now())?)
}

fn print_summary(report: &CrawlReport) {
    println!("run {} ({})", report.run_id, report.kind);
    for season in &report.seasons {
        match &season.status {
            SeasonStatus::Completed => println!(
                "  season {}: ok ({} pages, {} extracted, {} inserted, {} updated, {} ambiguous)",
                season.season,
                season.pages,
                season.counts.extracted,
                season.counts.inserted,
                season.counts.updated,
                season.counts.ambiguous,
            ),
            SeasonStatus::Failed { kind, page, detail } => println!(
                "  season {}: FAILED ({kind:?} at page {page}): {detail}",
                season.season,
            ),
        }
    }
}
