//! One migration run: preflight, registry preload, every phase in dependency
//! order, then fixup. Fixup runs even when the run is cancelled part way.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use super::context::{MigrationContext, RunOptions};
use super::copy::{BulkLoader, CopyTarget, PgCopyTarget};
use super::db::{Db, SESSION_TUNING};
use super::entity::{Entity, IdRange};
use super::etl::{run_phase, Phase, PhaseStats};
use super::fixup::{self, FixupReport};
use super::progress::{emit_stage_summary, StageTiming};
use super::source::{LegacyRow, SourceDb};
use super::sources::SourceAdapter;
use super::uploads::{run_uploads, AssetStore, UploadSettings, UploadSource};
use crate::normalization::bbcode::MarkupTransformer;
use crate::util::pg::connect_postgres_auto;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(String),
    Skip(&'static str),
}

#[derive(Debug, Clone)]
pub struct PlannedPhase {
    pub phase: Phase,
    pub step: Step,
}

/// Decide up front which phases this adapter and source can feed.
pub async fn plan(adapter: &dyn SourceAdapter, source: &SourceDb, uploads: bool) -> Vec<PlannedPhase> {
    let mut steps = Vec::with_capacity(Phase::ALL.len());
    for phase in Phase::ALL {
        let step = match adapter.query(phase) {
            None => Step::Skip("no source data"),
            Some(_) if phase == Phase::Uploads && !uploads => Step::Skip("uploads disabled"),
            Some(sql) => match adapter.optional_table(phase) {
                None => Step::Run(sql),
                Some(table) => match source.table_exists(&table).await {
                    Ok(true) => Step::Run(sql),
                    Ok(false) => Step::Skip("optional table missing"),
                    Err(e) => {
                        warn!(target: "preflight", table, error = %e, "table lookup failed");
                        Step::Skip("optional table missing")
                    }
                },
            },
        };
        steps.push(PlannedPhase { phase, step });
    }
    steps
}

async fn profile_stage<T, F>(name: &str, fut: F, succeeded: impl Fn(&T) -> bool) -> (T, StageTiming)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    let success = succeeded(&out);
    info!(
        target: "metrics",
        stage = name,
        took_ms = format!("{:.2}", elapsed.as_secs_f64() * 1000.0),
        success,
        "stage timing"
    );
    (out, StageTiming::new(name, elapsed, success))
}

/// Open the dedicated COPY connection with the run's session settings.
pub async fn copy_loader(database_url: &str, chunk_rows: usize) -> Result<BulkLoader<PgCopyTarget>> {
    let client = connect_postgres_auto(database_url)
        .await
        .context("opening the COPY connection")?;
    client
        .batch_execute(&SESSION_TUNING.join(";\n"))
        .await
        .context("tuning the COPY session")?;
    Ok(BulkLoader::new(PgCopyTarget::new(client), chunk_rows))
}

pub struct UploadPlan {
    pub store: Arc<dyn AssetStore>,
    pub settings: UploadSettings,
}

pub struct Migration {
    pub db: Db,
    pub source: SourceDb,
    pub adapter: Box<dyn SourceAdapter>,
    /// `None` skips the uploads phase.
    pub uploads: Option<UploadPlan>,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPhase {
    pub phase: Phase,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub adapter: &'static str,
    pub phases: Vec<PhaseStats>,
    pub skipped: Vec<SkippedPhase>,
    pub fixup: FixupReport,
    pub cancelled: bool,
    pub took_ms: u128,
}

impl RunSummary {
    pub fn rows(&self) -> u64 {
        self.phases.iter().map(|p| p.rows).sum()
    }

    pub fn failed(&self) -> u64 {
        self.phases.iter().map(|p| p.failed).sum()
    }

    /// Plain-text table for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<22} {:>10} {:>10} {:>8} {:>8} {:>8}",
            "phase", "read", "rows", "merged", "skipped", "failed"
        );
        for p in &self.phases {
            let flag = if p.bulk_failed { "  (rolled back)" } else { "" };
            let _ = writeln!(
                out,
                "{:<22} {:>10} {:>10} {:>8} {:>8} {:>8}{flag}",
                p.phase, p.read, p.rows, p.merged, p.skipped, p.failed
            );
        }
        for s in &self.skipped {
            let _ = writeln!(out, "{:<22} skipped: {}", s.phase.as_str(), s.reason);
        }
        let _ = writeln!(
            out,
            "{} rows written, {} failed, {} sequences reset in {:.1}s{}",
            self.rows(),
            self.failed(),
            self.fixup.sequences.len(),
            self.took_ms as f64 / 1000.0,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        out
    }
}

impl Migration {
    pub async fn run<T: CopyTarget>(
        self,
        mut options: RunOptions,
        loader: &mut BulkLoader<T>,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let Migration {
            db,
            source,
            adapter,
            uploads,
            shutdown,
        } = self;

        adapter.preflight(&source, &db).await?;
        options.merge |= adapter.merge();
        let markup = MarkupTransformer::new(adapter.dialect()?)?
            .decode_entities(adapter.decode_entities());
        let mut ctx = MigrationContext::new(options, markup)?;
        info!(
            target: "import",
            adapter = adapter.name(),
            convert_markup = ctx.options.convert_markup,
            merge = ctx.options.merge,
            "migration starting"
        );

        let (loaded, timing) = profile_stage("preload", ctx.preload(&db), Result::is_ok).await;
        ctx.stage_timings.push(timing);
        loaded.context("preloading the id registry")?;

        let mut skipped = Vec::new();
        let mut cancelled = false;
        for PlannedPhase { phase, step } in plan(adapter.as_ref(), &source, uploads.is_some()).await {
            if shutdown.load(Ordering::Relaxed) {
                info!(target: "import", phase = %phase, "shutdown requested; remaining phases skipped");
                cancelled = true;
                break;
            }
            let sql = match step {
                Step::Run(sql) => sql,
                Step::Skip(reason) => {
                    info!(target: "import", phase = %phase, reason, "phase skipped");
                    skipped.push(SkippedPhase { phase, reason });
                    continue;
                }
            };
            let spec = phase.spec();
            ctx.link_keys.clear();
            if let Some(keys_sql) = spec.link_keys {
                match db.link_keys(keys_sql).await {
                    Ok(keys) => ctx.link_keys = keys,
                    Err(e) => {
                        error!(target: "import", phase = spec.name, table = spec.table, error = ?e, "loading existing keys failed");
                        skipped.push(SkippedPhase {
                            phase,
                            reason: "existing keys unavailable",
                        });
                        continue;
                    }
                }
            }

            let bulk_ok = |s: &PhaseStats| !s.bulk_failed;
            let (stats, timing) = match (phase, uploads.as_ref()) {
                (Phase::Uploads, Some(up)) => {
                    let locate = |row: &mut LegacyRow| adapter.locate_upload(row);
                    let upload_source = UploadSource {
                        db: &source,
                        sql: &sql,
                        locate: &locate,
                    };
                    let fut = run_uploads(
                        &mut ctx,
                        loader,
                        upload_source,
                        Arc::clone(&up.store),
                        &up.settings,
                        Arc::clone(&shutdown),
                    );
                    profile_stage(spec.name, fut, bulk_ok).await
                }
                _ => profile_stage(spec.name, run_phase(&mut ctx, loader, &source, &sql, spec), bulk_ok).await,
            };
            ctx.stage_timings.push(timing);
            ctx.stats.push(stats);
        }

        let (fixup, timing) = profile_stage("fixup", fixup::run(&db), |r: &FixupReport| r.errors == 0).await;
        ctx.stage_timings.push(timing);

        for entity in [Entity::Topic, Entity::Post] {
            let public = ctx.registry.high_water(entity, IdRange::Public);
            let private = ctx.registry.high_water(entity, IdRange::Private);
            if public.is_some() || private.is_some() {
                info!(target: "import", %entity, ?public, ?private, "legacy id high-water marks");
            }
        }
        emit_stage_summary(&ctx.stage_timings);

        Ok(RunSummary {
            adapter: adapter.name(),
            phases: std::mem::take(&mut ctx.stats),
            skipped,
            fixup,
            cancelled,
            took_ms: started.elapsed().as_millis(),
        })
    }
}
