use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use forum_bulk_import::cli::db_counts::{self, DbCountsConfig};
use forum_bulk_import::cli::import::{self, ImportConfig, ImportOverrides, Target};
use forum_bulk_import::database_ops::runner::RunSummary;
use forum_bulk_import::database_ops::sources::AdapterKind;
use forum_bulk_import::logging::{init_tracing, DEFAULT_FILTER};

#[derive(Parser, Debug)]
#[command(name = "forum-import", version, about = "Bulk forum migration into a Discourse database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a legacy forum through one adapter
    Run {
        #[arg(value_enum)]
        adapter: AdapterKind,
        #[command(flatten)]
        args: ImportArgs,
    },
    /// Merge another Discourse database (MERGE_SOURCE_URL) into this one
    Merge {
        #[command(flatten)]
        args: ImportArgs,
    },
    /// List available adapters
    Adapters,
    /// Row counts of the destination tables
    Counts {
        /// List the most recently imported topics
        #[arg(long, action = ArgAction::SetTrue)]
        recent: bool,
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[derive(Debug, Default, Args)]
struct ImportArgs {
    /// Legacy database URL (overrides SOURCE_DB_URL / MERGE_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,
    /// Convert legacy bbcode/HTML into markdown (overrides CONVERT_MARKUP)
    #[arg(long, action = ArgAction::SetTrue)]
    convert_markup: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    no_convert_markup: bool,
    /// Directory holding the legacy attachment files
    #[arg(long)]
    uploads_root: Option<PathBuf>,
    /// Directory the imported uploads are written to
    #[arg(long)]
    uploads_dest: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    skip_uploads: bool,
    /// Legacy table prefix (phpbb_, GDN_, ...)
    #[arg(long)]
    table_prefix: Option<String>,
    /// Print the run summary as JSON instead of a table
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

impl ImportArgs {
    fn overrides(&self) -> ImportOverrides {
        let convert_markup = match (self.convert_markup, self.no_convert_markup) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        ImportOverrides {
            source_url: self.source_url.clone(),
            convert_markup,
            uploads_root: self.uploads_root.clone(),
            uploads_dest: self.uploads_dest.clone(),
            skip_uploads: self.skip_uploads,
            table_prefix: self.table_prefix.clone(),
        }
    }
}

fn list_adapters() {
    println!("Available adapters:");
    for kind in AdapterKind::ALL {
        println!("  {:<11} {}", kind.label(), kind.display());
    }
    println!("  {:<11} {}", "merge", "Another Discourse database (same schema version)");
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

async fn run_import(target: Target, args: ImportArgs) -> Result<()> {
    let cfg = ImportConfig::from_env(target, args.overrides())?;
    let summary = import::run(cfg).await?;
    print_summary(&summary, args.json)
}

#[tokio::main]
async fn main() -> Result<()> {
    forum_bulk_import::util::env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    match Cli::parse().command {
        Command::Run { adapter, args } => run_import(Target::Adapter(adapter), args).await,
        Command::Merge { args } => run_import(Target::Merge, args).await,
        Command::Adapters => {
            list_adapters();
            Ok(())
        }
        Command::Counts { recent, limit } => {
            let out = db_counts::run(DbCountsConfig {
                database_url: None,
                show_recent_topics: recent.then_some(true),
                recent_topics_limit: limit,
            })
            .await?;
            print!("{out}");
            Ok(())
        }
    }
}
