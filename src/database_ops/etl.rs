//! Streaming phase runner.
//!
//! Each phase reads its legacy query through a forward-only cursor, hands every
//! row to a typed transform and streams the resulting rows into one COPY. Rows
//! that fail are logged and skipped; a failing COPY abandons the phase only.

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::MigrationContext;
use super::copy::{BulkLoader, CopyLine, CopyRecord, CopyStream, CopyTarget};
use super::entity::{Entity, ImportRef, PRIVATE_OFFSET};
use super::process;
use super::records::{
    BadgeRow, CategoryRow, GroupRow, GroupUserRow, NotificationRow, PostActionRow, PostRow,
    TagRow, TargetRow, TopicAllowedUserRow, TopicRow, TopicTagRow, UploadRow, UserBadgeRow,
    UserEmailRow, UserProfileRow, UserRow, UserStatRow,
};
use super::source::{LegacyRow, SourceDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Groups,
    Users,
    GroupUsers,
    UserEmails,
    UserProfiles,
    UserStats,
    Categories,
    Topics,
    Posts,
    Tags,
    TopicTags,
    PostActions,
    Uploads,
    PrivateTopics,
    PrivatePosts,
    TopicAllowedUsers,
    Badges,
    UserBadges,
    Notifications,
}

impl Phase {
    /// Dependency order.
    pub const ALL: [Phase; 19] = [
        Phase::Groups,
        Phase::Users,
        Phase::GroupUsers,
        Phase::UserEmails,
        Phase::UserProfiles,
        Phase::UserStats,
        Phase::Categories,
        Phase::Topics,
        Phase::Posts,
        Phase::Tags,
        Phase::TopicTags,
        Phase::PostActions,
        Phase::Uploads,
        Phase::PrivateTopics,
        Phase::PrivatePosts,
        Phase::TopicAllowedUsers,
        Phase::Badges,
        Phase::UserBadges,
        Phase::Notifications,
    ];

    pub fn as_str(self) -> &'static str {
        self.spec().name
    }

    pub fn spec(self) -> &'static PhaseSpec {
        &PHASES[self as usize]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyImported,
    Blank,
    MissingReference(&'static str),
}

/// A transformed row plus what the runner records once it is written.
#[derive(Debug, Clone)]
pub struct Staged {
    pub row: TargetRow,
    pub import_ref: Option<ImportRef>,
    pub link_key: Option<(i64, i64, i64)>,
}

impl Staged {
    pub fn new(row: TargetRow) -> Self {
        Self {
            row,
            import_ref: None,
            link_key: None,
        }
    }

    pub fn imported(mut self, entity: Entity, legacy_id: i64, new_id: i64) -> Self {
        self.import_ref = Some(ImportRef::new(entity, legacy_id, new_id));
        self
    }

    pub fn keyed(mut self, key: (i64, i64, i64)) -> Self {
        self.link_key = Some(key);
        self
    }
}

#[derive(Debug, Clone)]
pub enum Transformed {
    Row(Staged),
    /// The legacy row maps onto an existing destination row; only the reference is kept.
    Merged(ImportRef),
    Skip(SkipReason),
}

pub type TransformFn = fn(&mut MigrationContext, &LegacyRow) -> Result<Transformed>;

pub struct PhaseSpec {
    pub phase: Phase,
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    /// Registry entity; rows whose `id` is already mapped are skipped.
    pub entity: Option<Entity>,
    /// Legacy ids in this phase live in the private range.
    pub private: bool,
    /// Three bigint columns of natural keys already present in `table`.
    pub link_keys: Option<&'static str>,
    pub transform: TransformFn,
}

const fn spec(
    phase: Phase,
    name: &'static str,
    table: &'static str,
    columns: &'static [&'static str],
    entity: Option<Entity>,
    transform: TransformFn,
) -> PhaseSpec {
    PhaseSpec {
        phase,
        name,
        table,
        columns,
        entity,
        private: false,
        link_keys: None,
        transform,
    }
}

const fn private(mut s: PhaseSpec) -> PhaseSpec {
    s.private = true;
    s
}

const fn keyed(mut s: PhaseSpec, sql: &'static str) -> PhaseSpec {
    s.link_keys = Some(sql);
    s
}

static PHASES: [PhaseSpec; 19] = [
    spec(Phase::Groups, "groups", GroupRow::TABLE, GroupRow::COLUMNS, Some(Entity::Group), process::group),
    spec(Phase::Users, "users", UserRow::TABLE, UserRow::COLUMNS, Some(Entity::User), process::user),
    keyed(
        spec(Phase::GroupUsers, "group_users", GroupUserRow::TABLE, GroupUserRow::COLUMNS, None, process::group_user),
        "SELECT group_id::bigint, user_id::bigint, 0::bigint FROM group_users",
    ),
    keyed(
        spec(Phase::UserEmails, "user_emails", UserEmailRow::TABLE, UserEmailRow::COLUMNS, None, process::user_email),
        "SELECT user_id::bigint, 0::bigint, 0::bigint FROM user_emails",
    ),
    keyed(
        spec(Phase::UserProfiles, "user_profiles", UserProfileRow::TABLE, UserProfileRow::COLUMNS, None, process::user_profile),
        "SELECT user_id::bigint, 0::bigint, 0::bigint FROM user_profiles",
    ),
    keyed(
        spec(Phase::UserStats, "user_stats", UserStatRow::TABLE, UserStatRow::COLUMNS, None, process::user_stat),
        "SELECT user_id::bigint, 0::bigint, 0::bigint FROM user_stats",
    ),
    spec(Phase::Categories, "categories", CategoryRow::TABLE, CategoryRow::COLUMNS, Some(Entity::Category), process::category),
    spec(Phase::Topics, "topics", TopicRow::TABLE, TopicRow::COLUMNS, Some(Entity::Topic), process::topic),
    spec(Phase::Posts, "posts", PostRow::TABLE, PostRow::COLUMNS, Some(Entity::Post), process::post),
    spec(Phase::Tags, "tags", TagRow::TABLE, TagRow::COLUMNS, Some(Entity::Tag), process::tag),
    keyed(
        spec(Phase::TopicTags, "topic_tags", TopicTagRow::TABLE, TopicTagRow::COLUMNS, None, process::topic_tag),
        "SELECT topic_id::bigint, tag_id::bigint, 0::bigint FROM topic_tags",
    ),
    keyed(
        spec(Phase::PostActions, "post_actions", PostActionRow::TABLE, PostActionRow::COLUMNS, Some(Entity::PostAction), process::post_action),
        "SELECT post_id::bigint, user_id::bigint, post_action_type_id::bigint FROM post_actions",
    ),
    spec(Phase::Uploads, "uploads", UploadRow::TABLE, UploadRow::COLUMNS, Some(Entity::Upload), process::upload),
    private(spec(Phase::PrivateTopics, "private_topics", TopicRow::TABLE, TopicRow::COLUMNS, Some(Entity::Topic), process::private_topic)),
    private(spec(Phase::PrivatePosts, "private_posts", PostRow::TABLE, PostRow::COLUMNS, Some(Entity::Post), process::post)),
    private(keyed(
        spec(Phase::TopicAllowedUsers, "topic_allowed_users", TopicAllowedUserRow::TABLE, TopicAllowedUserRow::COLUMNS, None, process::topic_allowed_user),
        "SELECT topic_id::bigint, user_id::bigint, 0::bigint FROM topic_allowed_users",
    )),
    spec(Phase::Badges, "badges", BadgeRow::TABLE, BadgeRow::COLUMNS, Some(Entity::Badge), process::badge),
    keyed(
        spec(Phase::UserBadges, "user_badges", UserBadgeRow::TABLE, UserBadgeRow::COLUMNS, None, process::user_badge),
        "SELECT badge_id::bigint, user_id::bigint, 0::bigint FROM user_badges",
    ),
    spec(Phase::Notifications, "notifications", NotificationRow::TABLE, NotificationRow::COLUMNS, Some(Entity::Notification), process::notification),
];

/// Shift a private-range row's ids so they cannot collide with public ones.
pub fn apply_private_offset(row: &mut LegacyRow) {
    for col in ["id", "topic_id", "reply_to_post_id"] {
        if let Some(v) = row.int(col) {
            row.set(col, v + PRIVATE_OFFSET);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStats {
    pub phase: &'static str,
    pub table: &'static str,
    pub read: u64,
    pub rows: u64,
    pub merged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub refs: u64,
    pub bulk_failed: bool,
    pub took_ms: u128,
}

impl PhaseStats {
    pub fn new(spec: &PhaseSpec) -> Self {
        Self {
            phase: spec.name,
            table: spec.table,
            ..Self::default()
        }
    }
}

/// Write side of one phase: the lazily opened COPY plus the refs it owes.
pub struct PhaseWriter {
    spec: &'static PhaseSpec,
    stream: Option<CopyStream>,
    refs: Vec<ImportRef>,
    /// Destination ids of rows streamed, as opposed to merged.
    written: HashSet<i64>,
    pub stats: PhaseStats,
}

impl PhaseWriter {
    pub fn new(spec: &'static PhaseSpec) -> Self {
        Self {
            spec,
            stream: None,
            refs: Vec::new(),
            written: HashSet::new(),
            stats: PhaseStats::new(spec),
        }
    }

    pub fn spec(&self) -> &'static PhaseSpec {
        self.spec
    }

    /// Record an outcome. `Err` means the COPY itself failed.
    pub async fn accept<T: CopyTarget>(
        &mut self,
        loader: &mut BulkLoader<T>,
        ctx: &mut MigrationContext,
        legacy_id: Option<i64>,
        outcome: Result<Transformed>,
    ) -> Result<()> {
        match outcome {
            Ok(Transformed::Row(staged)) => self.write(loader, ctx, staged).await?,
            Ok(Transformed::Merged(r)) => {
                if ctx.registry.insert_ref(&r) {
                    self.refs.push(r);
                }
                self.stats.merged += 1;
            }
            Ok(Transformed::Skip(reason)) => {
                self.stats.skipped += 1;
                debug!(target: "import", phase = self.spec.name, ?legacy_id, ?reason, "row skipped");
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(target: "import", phase = self.spec.name, ?legacy_id, error = %e, "row failed");
            }
        }
        Ok(())
    }

    async fn write<T: CopyTarget>(
        &mut self,
        loader: &mut BulkLoader<T>,
        ctx: &mut MigrationContext,
        staged: Staged,
    ) -> Result<()> {
        // Recorded before the write so a failing row is rolled back with the rest.
        if let Some(r) = staged.import_ref {
            ctx.registry.insert_ref(&r);
            self.written.insert(r.new_id);
            self.refs.push(r);
        }
        if let Some(key) = staged.link_key {
            ctx.link_keys.insert(key);
        }
        if self.stream.is_none() {
            self.stream = Some(loader.open(self.spec.table, self.spec.columns).await?);
        }
        let mut line = CopyLine::new();
        staged.row.encode(&mut line);
        if let Some(stream) = self.stream.as_mut() {
            stream.write_line(&mut line).await?;
        }
        self.stats.rows += 1;
        Ok(())
    }

    /// Finish the COPY and persist refs. On failure forget every ref this phase
    /// recorded and every lookup pointing at a row that was rolled back.
    pub async fn finish<T: CopyTarget>(
        mut self,
        loader: &mut BulkLoader<T>,
        ctx: &mut MigrationContext,
        copy_error: Option<anyhow::Error>,
    ) -> PhaseStats {
        let stream = self.stream.take();
        let result = match copy_error {
            Some(e) => Err(e),
            None if stream.is_none() && self.refs.is_empty() => Ok(None),
            None => loader.commit(stream, &self.refs).await.map(Some),
        };
        match result {
            Ok(outcome) => {
                if let Some(o) = outcome {
                    self.stats.refs = o.refs;
                }
            }
            Err(e) => {
                loader.rollback(None).await;
                ctx.registry.forget(&self.refs);
                ctx.forget_rows(self.spec.table, &self.written);
                self.stats.bulk_failed = true;
                self.stats.rows = 0;
                error!(phase = self.spec.name, table = self.spec.table, error = ?e, "bulk load failed; phase abandoned");
            }
        }
        self.stats
    }

    /// Drop an open stream without committing.
    pub async fn abort<T: CopyTarget>(&mut self, loader: &mut BulkLoader<T>) {
        loader.rollback(self.stream.take()).await;
    }
}

/// Run one phase of rows from `sql` through its transform into the destination.
pub async fn run_phase<T: CopyTarget>(
    ctx: &mut MigrationContext,
    loader: &mut BulkLoader<T>,
    source: &SourceDb,
    sql: &str,
    spec: &'static PhaseSpec,
) -> PhaseStats {
    let started = Instant::now();
    let total = match source.count(sql).await {
        Ok(n) => Some(n),
        Err(e) => {
            debug!(phase = spec.name, error = %e, "row count unavailable");
            None
        }
    };
    let mut progress = super::progress::Progress::new(spec.name, total);
    let mut writer = PhaseWriter::new(spec);
    let mut copy_error = None;

    let mut rows = source.stream(sql, ctx.options.charset);
    while let Some(next) = rows.next().await {
        let mut row = match next {
            Ok(row) => row,
            Err(e) => {
                error!(phase = spec.name, error = %e, "reading legacy rows failed");
                writer.stats.failed += 1;
                break;
            }
        };
        progress.tick(1);
        writer.stats.read += 1;
        if spec.private {
            apply_private_offset(&mut row);
        }
        let legacy_id = row.int("id");
        if let (Some(entity), Some(id)) = (spec.entity, legacy_id) {
            if ctx.registry.contains(entity, id) {
                writer.stats.skipped += 1;
                continue;
            }
        }
        let outcome = (spec.transform)(ctx, &row);
        if let Err(e) = writer.accept(loader, ctx, legacy_id, outcome).await {
            writer.abort(loader).await;
            copy_error = Some(e);
            break;
        }
    }
    drop(rows);
    progress.finish();

    let mut stats = writer.finish(loader, ctx, copy_error).await;
    stats.took_ms = started.elapsed().as_millis();
    info!(
        target: "import",
        phase = stats.phase,
        read = stats.read,
        rows = stats.rows,
        merged = stats.merged,
        skipped = stats.skipped,
        failed = stats.failed,
        "phase complete"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::context::RunOptions;
    use crate::database_ops::testing::MemoryCopyTarget;
    use crate::normalization::bbcode::MarkupTransformer;
    use sqlx::sqlite::SqlitePoolOptions;

    fn context() -> MigrationContext {
        MigrationContext::new(RunOptions::default(), MarkupTransformer::new(Vec::new()).unwrap())
            .unwrap()
    }

    async fn source(statements: &[&str]) -> SourceDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for sql in statements {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        SourceDb::Sqlite(pool)
    }

    #[test]
    fn phase_table_is_in_dependency_order() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.spec().phase, *phase, "slot {i}");
        }
        let pos = |p: Phase| Phase::ALL.iter().position(|x| *x == p).unwrap();
        assert!(pos(Phase::Users) < pos(Phase::Topics));
        assert!(pos(Phase::Topics) < pos(Phase::Posts));
        assert!(pos(Phase::PrivateTopics) < pos(Phase::TopicAllowedUsers));
        assert!(Phase::PrivatePosts.spec().private);
        assert!(!Phase::Posts.spec().private);
    }

    #[test]
    fn private_offset_shifts_ids_only() {
        let mut row = LegacyRow::new()
            .with("id", 5i64)
            .with("topic_id", 2i64)
            .with("user_id", 9i64);
        apply_private_offset(&mut row);
        assert_eq!(row.int("id"), Some(PRIVATE_OFFSET + 5));
        assert_eq!(row.int("topic_id"), Some(PRIVATE_OFFSET + 2));
        assert_eq!(row.int("user_id"), Some(9));
    }

    #[tokio::test]
    async fn users_with_case_differing_names_get_distinct_usernames() {
        let src = source(&[
            "CREATE TABLE users (id INTEGER, username TEXT, email TEXT)",
            "INSERT INTO users VALUES (1, 'bob', 'a@x.io'), (2, 'Bob', 'b@x.io')",
        ])
        .await;
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 100);
        let mut ctx = context();
        let stats = run_phase(
            &mut ctx,
            &mut loader,
            &src,
            "SELECT id, username, email FROM users ORDER BY id",
            Phase::Users.spec(),
        )
        .await;
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.refs, 2);
        let lines = target.lines("users");
        let names: Vec<&str> = lines.iter().map(|l| l.split('\t').nth(1).unwrap()).collect();
        assert_eq!(names, ["bob", "bob_1"]);
        assert_eq!(target.lines("user_custom_fields").len(), 2);
    }

    #[tokio::test]
    async fn rerun_skips_rows_already_mapped() {
        let src = source(&[
            "CREATE TABLE users (id INTEGER, username TEXT, email TEXT)",
            "INSERT INTO users VALUES (1, 'ann', 'ann@x.io'), (2, 'cy', NULL)",
        ])
        .await;
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 100);
        let mut ctx = context();
        ctx.registry.insert(Entity::User, 1, 77);
        let stats = run_phase(
            &mut ctx,
            &mut loader,
            &src,
            "SELECT id, username, email FROM users ORDER BY id",
            Phase::Users.spec(),
        )
        .await;
        assert_eq!((stats.read, stats.rows, stats.skipped), (2, 1, 1));
        assert_eq!(ctx.registry.map(Entity::User, 1), Some(77));
        assert!(ctx.registry.contains(Entity::User, 2));
    }

    #[tokio::test]
    async fn failed_copy_forgets_phase_refs() {
        let src = source(&[
            "CREATE TABLE tags (id INTEGER, name TEXT)",
            "INSERT INTO tags VALUES (1, 'rust'), (2, 'go')",
        ])
        .await;
        let target = MemoryCopyTarget::default();
        target.fail_table("tags");
        let mut loader = BulkLoader::new(target.clone(), 1);
        let mut ctx = context();
        let stats = run_phase(
            &mut ctx,
            &mut loader,
            &src,
            "SELECT id, name FROM tags",
            Phase::Tags.spec(),
        )
        .await;
        assert!(stats.bulk_failed);
        assert_eq!(stats.rows, 0);
        assert!(!ctx.registry.contains(Entity::Tag, 1));
        assert!(target.lines("tags").is_empty());
        assert!(ctx.tags_by_name.is_empty());
    }

    #[tokio::test]
    async fn failed_copy_keeps_merged_lookups() {
        let src = source(&[
            "CREATE TABLE tags (id INTEGER, name TEXT)",
            "INSERT INTO tags VALUES (1, 'rust'), (2, 'go')",
        ])
        .await;
        let target = MemoryCopyTarget::default();
        target.fail_table("tags");
        let mut loader = BulkLoader::new(target.clone(), 1);
        let mut ctx = MigrationContext::new(
            RunOptions {
                merge: true,
                ..RunOptions::default()
            },
            MarkupTransformer::new(Vec::new()).unwrap(),
        )
        .unwrap();
        ctx.tags_by_name.insert("rust".into(), 500);
        let stats = run_phase(
            &mut ctx,
            &mut loader,
            &src,
            "SELECT id, name FROM tags ORDER BY id",
            Phase::Tags.spec(),
        )
        .await;
        assert!(stats.bulk_failed);
        assert_eq!(ctx.tags_by_name.get("rust"), Some(&500));
        assert!(!ctx.tags_by_name.contains_key("go"));
        assert!(!ctx.registry.contains(Entity::Tag, 2));
    }
}
