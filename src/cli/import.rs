//! Bodies of `forum-import run` and `forum-import merge`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use encoding_rs::Encoding;
use tracing::{info, warn};

use crate::database_ops::context::RunOptions;
use crate::database_ops::db::Db;
use crate::database_ops::merge::MergeAdapter;
use crate::database_ops::runner::{copy_loader, Migration, RunSummary, UploadPlan};
use crate::database_ops::source::SourceDb;
use crate::database_ops::sources::{build_adapter, AdapterKind, SourceAdapter};
use crate::database_ops::uploads::{FsAssetStore, UploadSettings};
use crate::util::env::{self as env_util, env_opt, env_parse, parse_flag};

const DEFAULT_UPLOADS_DEST: &str = "public/uploads/default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Adapter(AdapterKind),
    Merge,
}

impl Target {
    fn label(self) -> &'static str {
        match self {
            Target::Adapter(kind) => kind.label(),
            Target::Merge => "merge",
        }
    }

    fn source_key(self) -> &'static str {
        match self {
            Target::Adapter(_) => "SOURCE_DB_URL",
            Target::Merge => "MERGE_SOURCE_URL",
        }
    }
}

/// Command-line values; each one wins over its environment variable.
#[derive(Debug, Clone, Default)]
pub struct ImportOverrides {
    pub source_url: Option<String>,
    pub convert_markup: Option<bool>,
    pub uploads_root: Option<PathBuf>,
    pub uploads_dest: Option<PathBuf>,
    pub skip_uploads: bool,
    pub table_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub target: Target,
    pub database_url: String,
    pub source_url: String,
    pub max_connections: u32,
    /// `None` leaves the choice to the adapter.
    pub convert_markup: Option<bool>,
    pub table_prefix: Option<String>,
    pub charset: Option<&'static Encoding>,
    pub uploads_root: Option<PathBuf>,
    pub uploads_dest: PathBuf,
    pub skip_uploads: bool,
    pub upload_workers: usize,
    pub copy_chunk_rows: usize,
}

fn charset_for(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| anyhow!("unknown SOURCE_CHARSET `{label}`"))
}

impl ImportConfig {
    pub fn from_env(target: Target, overrides: ImportOverrides) -> Result<Self> {
        env_util::init_env();
        env_util::preflight_check(
            target.label(),
            &[],
            &[
                "DATABASE_URL",
                target.source_key(),
                "CONVERT_MARKUP",
                "TABLE_PREFIX",
                "SOURCE_CHARSET",
                "UPLOADS_ROOT",
                "UPLOAD_WORKERS",
                "COPY_CHUNK_ROWS",
            ],
        )?;
        let database_url = env_util::db_url()?;
        let source_url = match overrides.source_url {
            Some(url) => url,
            None => env_util::env_req(target.source_key())
                .with_context(|| format!("{} is required", target.source_key()))?,
        };
        let convert_markup = overrides
            .convert_markup
            .or_else(|| env_opt("CONVERT_MARKUP").and_then(|v| parse_flag(&v)));
        let charset = env_opt("SOURCE_CHARSET").map(|l| charset_for(&l)).transpose()?;
        Ok(Self {
            target,
            database_url,
            source_url,
            max_connections: env_parse("DB_MAX_CONNS", 8u32),
            convert_markup,
            table_prefix: overrides.table_prefix.or_else(|| env_opt("TABLE_PREFIX")),
            charset,
            uploads_root: overrides
                .uploads_root
                .or_else(|| env_opt("UPLOADS_ROOT").map(PathBuf::from)),
            uploads_dest: overrides
                .uploads_dest
                .or_else(|| env_opt("UPLOADS_DEST").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOADS_DEST)),
            skip_uploads: overrides.skip_uploads,
            upload_workers: env_parse("UPLOAD_WORKERS", 4usize).max(1),
            copy_chunk_rows: env_parse("COPY_CHUNK_ROWS", 1_000usize).max(1),
        })
    }

    fn upload_plan(&self) -> Option<UploadPlan> {
        if self.skip_uploads {
            return None;
        }
        let Some(root) = &self.uploads_root else {
            info!(target: "uploads", "UPLOADS_ROOT not set; uploads phase disabled");
            return None;
        };
        Some(UploadPlan {
            store: Arc::new(FsAssetStore::new(root.clone(), self.uploads_dest.clone())),
            settings: UploadSettings {
                workers: self.upload_workers,
                ..UploadSettings::default()
            },
        })
    }
}

/// Ctrl-C flips the flag once; the run winds down cooperatively.
fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work, then running fixup");
            flag.store(true, Ordering::Relaxed);
        }
    });
    shutdown
}

pub async fn run(cfg: ImportConfig) -> Result<RunSummary> {
    let db = Db::connect_no_migrate(&cfg.database_url, cfg.max_connections).await?;
    let source = SourceDb::connect(&cfg.source_url).await?;
    let adapter: Box<dyn SourceAdapter> = match cfg.target {
        Target::Adapter(kind) => build_adapter(kind, cfg.table_prefix.clone(), &source).await?,
        Target::Merge => Box::new(MergeAdapter),
    };
    let options = RunOptions {
        convert_markup: cfg.convert_markup.unwrap_or_else(|| adapter.convert_markup()),
        merge: adapter.merge(),
        charset: cfg.charset,
        now: Utc::now(),
    };
    let mut loader = copy_loader(&cfg.database_url, cfg.copy_chunk_rows).await?;
    let migration = Migration {
        db,
        source,
        adapter,
        uploads: cfg.upload_plan(),
        shutdown: install_shutdown_handler(),
    };
    let summary = migration.run(options, &mut loader).await?;
    info!(
        target: "import",
        adapter = summary.adapter,
        rows = summary.rows(),
        failed = summary.failed(),
        took_s = Duration::from_millis(summary.took_ms as u64).as_secs(),
        cancelled = summary.cancelled,
        "migration finished"
    );
    Ok(summary)
}
