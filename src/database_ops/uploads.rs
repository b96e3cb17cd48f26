//! Attachment migration.
//!
//! A producer streams upload rows into a bounded queue, a fixed pool of workers
//! copies files through an [`AssetStore`], and the calling task is the only
//! writer: it turns finished results into rows on the phase's single COPY.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::context::MigrationContext;
use super::copy::{BulkLoader, CopyTarget};
use super::entity::Entity;
use super::etl::{Phase, PhaseStats, PhaseWriter};
use super::process;
use super::progress::Progress;
use super::source::{LegacyRow, SourceDb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub sha1: String,
    pub url: String,
    pub filesize: i64,
    pub extension: Option<String>,
}

/// Where legacy files come from and where stored copies go.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn store(&self, owner: i64, bytes: &[u8], filename: &str) -> Result<StoredAsset>;
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    Sha1::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn extension_of(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}

/// Legacy files under `source_root`, stored copies under `dest_root` in the
/// `original/1X/<sha1>.<ext>` layout.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    source_root: PathBuf,
    dest_root: PathBuf,
    url_prefix: String,
}

impl FsAssetStore {
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            url_prefix: "/uploads/default".to_string(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("refusing path outside the uploads root: {path}"));
        }
        Ok(self.source_root.join(rel))
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(p) => tokio::fs::try_exists(p).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("reading {}", full.display()))
    }

    async fn store(&self, owner: i64, bytes: &[u8], filename: &str) -> Result<StoredAsset> {
        let sha1 = sha1_hex(bytes);
        let extension = extension_of(filename);
        let name = match &extension {
            Some(ext) => format!("{sha1}.{ext}"),
            None => sha1.clone(),
        };
        let rel = format!("original/1X/{name}");
        let target = self.dest_root.join(&rel);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            if let Some(dir) = target.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&target, bytes)
                .await
                .with_context(|| format!("writing {}", target.display()))?;
        }
        debug!(target: "uploads", owner, %sha1, "asset stored");
        Ok(StoredAsset {
            url: format!("{}/{rel}", self.url_prefix),
            sha1,
            filesize: bytes.len() as i64,
            extension,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub workers: usize,
    pub queue: usize,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: 64,
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

const STOP_POLL: Duration = Duration::from_millis(50);

/// The run-wide Ctrl-C flag plus this phase's own stop flag, set when its COPY
/// fails. Either one stops the pool; only the first cancels the run.
#[derive(Debug, Clone)]
struct Stop {
    run: Arc<AtomicBool>,
    phase: Arc<AtomicBool>,
}

impl Stop {
    fn new(run: Arc<AtomicBool>) -> Self {
        Self {
            run,
            phase: Arc::new(AtomicBool::new(false)),
        }
    }

    fn requested(&self) -> bool {
        self.run.load(Ordering::Relaxed) || self.phase.load(Ordering::Relaxed)
    }

    fn halt_phase(&self) {
        self.phase.store(true, Ordering::Relaxed);
    }

    async fn wait(&self) {
        while !self.requested() {
            tokio::time::sleep(STOP_POLL).await;
        }
    }
}

#[derive(Debug)]
enum JobResult {
    Stored(LegacyRow),
    Missing { legacy_id: Option<i64>, path: String },
    Failed { legacy_id: Option<i64>, error: anyhow::Error },
}

async fn copy_with_retry(
    store: &dyn AssetStore,
    mut row: LegacyRow,
    settings: &UploadSettings,
) -> JobResult {
    let legacy_id = row.int("id");
    let Some(path) = row.text_nonempty("path") else {
        return JobResult::Missing {
            legacy_id,
            path: String::new(),
        };
    };
    if !store.exists(&path).await {
        return JobResult::Missing { legacy_id, path };
    }
    let filename = row.text_nonempty("filename").unwrap_or_else(|| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    });
    let owner = row.int("user_id").unwrap_or_default();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let copied = match store.read(&path).await {
            Ok(bytes) => store.store(owner, &bytes, &filename).await,
            Err(e) => Err(e),
        };
        match copied {
            Ok(asset) => {
                row.set("sha1", asset.sha1);
                row.set("url", asset.url);
                row.set("filesize", asset.filesize);
                row.set("extension", asset.extension);
                row.set("filename", filename);
                return JobResult::Stored(row);
            }
            Err(e) if attempt < settings.attempts => {
                debug!(target: "uploads", ?legacy_id, attempt, error = %e, "retrying upload");
                tokio::time::sleep(settings.backoff * attempt).await;
            }
            Err(error) => return JobResult::Failed { legacy_id, error },
        }
    }
}

async fn worker(
    n: usize,
    jobs: Arc<Mutex<mpsc::Receiver<LegacyRow>>>,
    results: mpsc::Sender<JobResult>,
    store: Arc<dyn AssetStore>,
    settings: UploadSettings,
    stop: Stop,
) {
    let mut done = 0u64;
    loop {
        if stop.requested() {
            break;
        }
        let next = jobs.lock().await.recv().await;
        let Some(row) = next else { break };
        let result = copy_with_retry(store.as_ref(), row, &settings).await;
        done += 1;
        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!(target: "uploads", worker = n, done, "upload worker finished");
}

/// Where the phase's rows come from. `locate` fills in the `path` column for
/// sources that do not store one.
pub struct UploadSource<'a> {
    pub db: &'a SourceDb,
    pub sql: &'a str,
    pub locate: &'a (dyn Fn(&mut LegacyRow) + Sync),
}

async fn produce(
    source: &UploadSource<'_>,
    charset: Option<&'static encoding_rs::Encoding>,
    done: HashSet<i64>,
    jobs: mpsc::Sender<LegacyRow>,
    stop: &Stop,
) -> (u64, u64) {
    let (mut queued, mut skipped) = (0u64, 0u64);
    let mut rows = source.db.stream(source.sql, charset);
    while let Some(next) = rows.next().await {
        if stop.requested() {
            info!(target: "uploads", queued, "stop requested; no more uploads queued");
            break;
        }
        let mut row = match next {
            Ok(row) => row,
            Err(e) => {
                warn!(target: "uploads", error = %e, "reading upload rows failed");
                break;
            }
        };
        if row.int("id").is_some_and(|id| done.contains(&id)) {
            skipped += 1;
            continue;
        }
        (source.locate)(&mut row);
        // A full queue must not outlive a stop request.
        tokio::select! {
            sent = jobs.send(row) => {
                if sent.is_err() {
                    break;
                }
            }
            () = stop.wait() => {
                info!(target: "uploads", queued, "stop requested; no more uploads queued");
                break;
            }
        }
        queued += 1;
    }
    (queued, skipped)
}

/// Run the uploads phase. Cooperative cancellation through `shutdown`: queued
/// work stops being pulled, finished results are still written. A failed COPY
/// stops this phase's pool without cancelling the run.
pub async fn run_uploads<T: CopyTarget>(
    ctx: &mut MigrationContext,
    loader: &mut BulkLoader<T>,
    source: UploadSource<'_>,
    store: Arc<dyn AssetStore>,
    settings: &UploadSettings,
    shutdown: Arc<AtomicBool>,
) -> PhaseStats {
    let started = Instant::now();
    let spec = Phase::Uploads.spec();
    let (job_tx, job_rx) = mpsc::channel::<LegacyRow>(settings.queue.max(1));
    let (res_tx, mut res_rx) = mpsc::channel::<JobResult>(settings.queue.max(1));
    let job_rx = Arc::new(Mutex::new(job_rx));
    let stop = Stop::new(shutdown);

    let mut handles = Vec::with_capacity(settings.workers.max(1));
    for n in 0..settings.workers.max(1) {
        handles.push(tokio::spawn(worker(
            n,
            Arc::clone(&job_rx),
            res_tx.clone(),
            Arc::clone(&store),
            settings.clone(),
            stop.clone(),
        )));
    }
    // Workers hold the only receivers; once they exit, sends fail.
    drop(job_rx);
    drop(res_tx);

    let done = ctx.registry.legacy_ids(Entity::Upload);
    let charset = ctx.options.charset;
    let mut writer = PhaseWriter::new(spec);
    let mut progress = Progress::new(spec.name, None);
    let mut copy_error = None;

    let producer = produce(&source, charset, done, job_tx, &stop);
    let drain = async {
        while let Some(result) = res_rx.recv().await {
            progress.tick(1);
            writer.stats.read += 1;
            if copy_error.is_some() {
                continue;
            }
            match result {
                JobResult::Stored(row) => {
                    let legacy_id = row.int("id");
                    let outcome = process::upload(ctx, &row);
                    if let Err(e) = writer.accept(loader, ctx, legacy_id, outcome).await {
                        writer.abort(loader).await;
                        stop.halt_phase();
                        copy_error = Some(e);
                    }
                }
                JobResult::Missing { legacy_id, path } => {
                    writer.stats.failed += 1;
                    warn!(target: "uploads", ?legacy_id, path, "upload file missing");
                }
                JobResult::Failed { legacy_id, error } => {
                    writer.stats.failed += 1;
                    warn!(target: "uploads", ?legacy_id, error = ?error, "upload failed after retries");
                }
            }
        }
    };
    let ((queued, skipped), ()) = tokio::join!(producer, drain);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(target: "uploads", error = %e, "upload worker panicked");
        }
    }
    progress.finish();
    writer.stats.skipped += skipped;
    let mut stats = writer.finish(loader, ctx, copy_error).await;
    stats.took_ms = started.elapsed().as_millis();
    info!(target: "uploads", queued, rows = stats.rows, merged = stats.merged, failed = stats.failed, "uploads complete");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::context::RunOptions;
    use crate::database_ops::testing::MemoryCopyTarget;
    use crate::normalization::bbcode::MarkupTransformer;
    use sqlx::sqlite::SqlitePoolOptions;

    fn fast() -> UploadSettings {
        UploadSettings {
            workers: 2,
            queue: 4,
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    async fn uploads_source(rows: &str) -> SourceDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE uploads (id INTEGER, user_id INTEGER, path TEXT, filename TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(&format!("INSERT INTO uploads VALUES {rows}"))
            .execute(&pool)
            .await
            .unwrap();
        SourceDb::Sqlite(pool)
    }

    #[tokio::test]
    async fn fs_store_uses_content_addressed_paths() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.PNG"), b"png-bytes").unwrap();
        let store = FsAssetStore::new(src.path(), dest.path());
        assert!(store.exists("a.PNG").await);
        assert!(!store.exists("missing.png").await);
        assert!(!store.exists("../etc/passwd").await);
        let bytes = store.read("a.PNG").await.unwrap();
        let asset = store.store(1, &bytes, "a.PNG").await.unwrap();
        assert_eq!(asset.sha1, sha1_hex(b"png-bytes"));
        assert_eq!(asset.extension.as_deref(), Some("png"));
        assert_eq!(
            asset.url,
            format!("/uploads/default/original/1X/{}.png", asset.sha1)
        );
        assert!(dest
            .path()
            .join(format!("original/1X/{}.png", asset.sha1))
            .exists());
    }

    #[tokio::test]
    async fn uploads_phase_writes_dedupes_and_reports_missing() {
        let files = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(files.path().join("one.jpg"), b"same").unwrap();
        std::fs::write(files.path().join("two.jpg"), b"same").unwrap();
        std::fs::write(files.path().join("three.txt"), b"other").unwrap();
        let source = uploads_source(
            "(1, 5, 'one.jpg', 'one.jpg'), (2, 5, 'two.jpg', NULL), \
             (3, 6, 'three.txt', 'three.txt'), (4, 6, 'gone.gif', 'gone.gif')",
        )
        .await;
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 10);
        let mut ctx =
            MigrationContext::new(RunOptions::default(), MarkupTransformer::new(Vec::new()).unwrap())
                .unwrap();
        let store: Arc<dyn AssetStore> = Arc::new(FsAssetStore::new(files.path(), dest.path()));
        let stats = run_uploads(
            &mut ctx,
            &mut loader,
            UploadSource {
                db: &source,
                sql: "SELECT id, user_id, path, filename FROM uploads",
                locate: &|_: &mut LegacyRow| {},
            },
            store,
            &fast(),
            Arc::new(AtomicBool::new(false)),
        )
        .await;
        assert_eq!(stats.read, 4);
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(target.lines("uploads").len(), 2);
        for legacy in 1..=3 {
            assert!(ctx.registry.contains(Entity::Upload, legacy));
        }
        assert_eq!(
            ctx.registry.map(Entity::Upload, 1),
            ctx.registry.map(Entity::Upload, 2)
        );
    }

    /// Every file exists and takes `delay` to read.
    struct SlowStore {
        delay: Duration,
    }

    #[async_trait]
    impl AssetStore for SlowStore {
        async fn exists(&self, _path: &str) -> bool {
            true
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            Ok(path.as_bytes().to_vec())
        }

        async fn store(&self, _owner: i64, bytes: &[u8], _filename: &str) -> Result<StoredAsset> {
            let sha1 = sha1_hex(bytes);
            Ok(StoredAsset {
                url: format!("/uploads/default/original/1X/{sha1}"),
                sha1,
                filesize: bytes.len() as i64,
                extension: None,
            })
        }
    }

    fn many_rows(n: i64) -> String {
        (1..=n)
            .map(|i| format!("({i}, 1, 'f{i}.bin', 'f{i}.bin')"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[tokio::test]
    async fn interrupt_mid_phase_returns_and_keeps_finished_work() {
        let source = uploads_source(&many_rows(200)).await;
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 10);
        let mut ctx =
            MigrationContext::new(RunOptions::default(), MarkupTransformer::new(Vec::new()).unwrap())
                .unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::Relaxed);
        });
        let retry = fast();
        let run = run_uploads(
            &mut ctx,
            &mut loader,
            UploadSource {
                db: &source,
                sql: "SELECT id, user_id, path, filename FROM uploads ORDER BY id",
                locate: &|_: &mut LegacyRow| {},
            },
            Arc::new(SlowStore {
                delay: Duration::from_millis(20),
            }),
            &retry,
            Arc::clone(&shutdown),
        );
        let stats = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("uploads phase hung after interrupt");
        assert!(stats.read < 200, "read {}", stats.read);
        assert!(!stats.bulk_failed);
        assert_eq!(target.lines("uploads").len() as u64, stats.rows);
    }

    #[tokio::test]
    async fn failed_copy_stops_the_pool_but_not_the_run() {
        let source = uploads_source(&many_rows(200)).await;
        let target = MemoryCopyTarget::default();
        target.fail_table("uploads");
        let mut loader = BulkLoader::new(target.clone(), 1);
        let mut ctx =
            MigrationContext::new(RunOptions::default(), MarkupTransformer::new(Vec::new()).unwrap())
                .unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let retry = fast();
        let run = run_uploads(
            &mut ctx,
            &mut loader,
            UploadSource {
                db: &source,
                sql: "SELECT id, user_id, path, filename FROM uploads ORDER BY id",
                locate: &|_: &mut LegacyRow| {},
            },
            Arc::new(SlowStore {
                delay: Duration::from_millis(1),
            }),
            &retry,
            Arc::clone(&shutdown),
        );
        let stats = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("uploads phase hung after a failed COPY");
        assert!(stats.bulk_failed);
        assert_eq!(stats.rows, 0);
        assert!(!shutdown.load(Ordering::Relaxed));
        assert!(ctx.uploads_by_sha1.is_empty());
        assert!(target.lines("uploads").is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_queueing() {
        let files = tempfile::tempdir().unwrap();
        let source = uploads_source("(1, 1, 'a.jpg', 'a.jpg')").await;
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 10);
        let mut ctx =
            MigrationContext::new(RunOptions::default(), MarkupTransformer::new(Vec::new()).unwrap())
                .unwrap();
        let store: Arc<dyn AssetStore> = Arc::new(FsAssetStore::new(files.path(), files.path()));
        let stats = run_uploads(
            &mut ctx,
            &mut loader,
            UploadSource {
                db: &source,
                sql: "SELECT id, user_id, path, filename FROM uploads",
                locate: &|_: &mut LegacyRow| {},
            },
            store,
            &fast(),
            Arc::new(AtomicBool::new(true)),
        )
        .await;
        assert_eq!(stats.read, 0);
        assert!(target.statements().is_empty());
    }
}
