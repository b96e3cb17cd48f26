//! Bulk loading over `COPY ... FROM STDIN` (text format).
//!
//! One loader call holds one COPY stream open for a whole phase. Rows are
//! buffered and flushed every `chunk_rows`; import references are written by a
//! second COPY in the same transaction once the row stream has finished.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use std::fmt::Write as _;
use std::pin::Pin;
use tokio_postgres::{Client, CopyInSink};
use tracing::{debug, warn};

use super::entity::{
    Entity, ImportRef, ImportRefStore, IMPORT_ID_FIELD, IMPORT_REFERENCES_TABLE,
};

/// A value that can be written as one field of a text-format COPY line.
pub trait CopyValue {
    fn write_copy(&self, out: &mut String);
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => {}
            c => out.push(c),
        }
    }
}

impl CopyValue for str {
    fn write_copy(&self, out: &mut String) {
        escape_into(out, self);
    }
}

impl CopyValue for String {
    fn write_copy(&self, out: &mut String) {
        escape_into(out, self);
    }
}

impl CopyValue for i64 {
    fn write_copy(&self, out: &mut String) {
        let _ = write!(out, "{self}");
    }
}

impl CopyValue for i32 {
    fn write_copy(&self, out: &mut String) {
        let _ = write!(out, "{self}");
    }
}

impl CopyValue for f64 {
    fn write_copy(&self, out: &mut String) {
        let _ = write!(out, "{self}");
    }
}

impl CopyValue for bool {
    fn write_copy(&self, out: &mut String) {
        out.push(if *self { 't' } else { 'f' });
    }
}

impl CopyValue for DateTime<Utc> {
    fn write_copy(&self, out: &mut String) {
        let _ = write!(out, "{}", self.format("%Y-%m-%d %H:%M:%S%.6f+00"));
    }
}

impl<T: CopyValue + ?Sized> CopyValue for &T {
    fn write_copy(&self, out: &mut String) {
        (**self).write_copy(out);
    }
}

impl<T: CopyValue> CopyValue for Option<T> {
    fn write_copy(&self, out: &mut String) {
        match self {
            Some(v) => v.write_copy(out),
            None => out.push_str("\\N"),
        }
    }
}

/// Encoder for one COPY line; fields are tab-separated in push order.
#[derive(Debug, Default)]
pub struct CopyLine {
    buf: String,
    fields: usize,
}

impl CopyLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<V: CopyValue + ?Sized>(&mut self, value: &V) -> &mut Self {
        if self.fields > 0 {
            self.buf.push('\t');
        }
        value.write_copy(&mut self.buf);
        self.fields += 1;
        self
    }

    pub fn fields(&self) -> usize {
        self.fields
    }

    /// Finish the line (appends the newline) and reset the encoder.
    pub fn take(&mut self) -> String {
        let mut line = std::mem::take(&mut self.buf);
        line.push('\n');
        self.fields = 0;
        line
    }
}

/// A destination row encodable in a fixed column order.
pub trait CopyRecord {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    fn encode(&self, line: &mut CopyLine);
}

pub fn copy_statement(table: &str, columns: &[&str]) -> String {
    let cols = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("COPY {table} ({cols}) FROM STDIN")
}

#[async_trait]
pub trait CopySink: Send {
    async fn send(&mut self, chunk: Bytes) -> Result<()>;
    /// Complete the COPY, returning the row count the server reports.
    async fn finish(self: Box<Self>) -> Result<u64>;
}

/// Connection able to run plain statements and open COPY streams.
#[async_trait]
pub trait CopyTarget: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;
    async fn copy_in(&mut self, statement: &str) -> Result<Box<dyn CopySink>>;
}

pub struct PgCopyTarget {
    client: Client,
}

impl PgCopyTarget {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

struct PgCopySink {
    sink: Pin<Box<CopyInSink<Bytes>>>,
}

#[async_trait]
impl CopySink for PgCopySink {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        self.sink.send(chunk).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64> {
        Ok(self.sink.as_mut().finish().await?)
    }
}

#[async_trait]
impl CopyTarget for PgCopyTarget {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn copy_in(&mut self, statement: &str) -> Result<Box<dyn CopySink>> {
        let sink = self.client.copy_in::<_, Bytes>(statement).await?;
        Ok(Box::new(PgCopySink {
            sink: Box::pin(sink),
        }))
    }
}

/// An open COPY stream for one table.
pub struct CopyStream {
    table: &'static str,
    columns: usize,
    sink: Box<dyn CopySink>,
    buf: String,
    buffered: usize,
    chunk_rows: usize,
    rows: u64,
}

impl CopyStream {
    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub async fn write_line(&mut self, line: &mut CopyLine) -> Result<()> {
        if line.fields() != self.columns {
            return Err(anyhow!(
                "{}: encoded {} fields for {} columns",
                self.table,
                line.fields(),
                self.columns
            ));
        }
        self.buf.push_str(&line.take());
        self.buffered += 1;
        self.rows += 1;
        if self.buffered >= self.chunk_rows {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn write<R: CopyRecord>(&mut self, record: &R) -> Result<()> {
        let mut line = CopyLine::new();
        record.encode(&mut line);
        self.write_line(&mut line).await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        self.buffered = 0;
        self.sink
            .send(chunk)
            .await
            .with_context(|| format!("COPY into {} failed", self.table))
    }

    async fn finish(mut self) -> Result<u64> {
        self.flush().await?;
        let table = self.table;
        self.sink
            .finish()
            .await
            .with_context(|| format!("finishing COPY into {table}"))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows: u64,
    pub refs: u64,
}

pub struct BulkLoader<T: CopyTarget> {
    target: T,
    chunk_rows: usize,
    in_transaction: bool,
}

impl<T: CopyTarget> BulkLoader<T> {
    pub fn new(target: T, chunk_rows: usize) -> Self {
        Self {
            target,
            chunk_rows: chunk_rows.max(1),
            in_transaction: false,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    async fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.target.execute("BEGIN").await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Start a transaction and open the row COPY for `table`.
    pub async fn open(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
    ) -> Result<CopyStream> {
        self.begin().await?;
        let sink = match self.target.copy_in(&copy_statement(table, columns)).await {
            Ok(sink) => sink,
            Err(e) => {
                self.rollback(None).await;
                return Err(e.context(format!("opening COPY into {table}")));
            }
        };
        Ok(CopyStream {
            table,
            columns: columns.len(),
            sink,
            buf: String::new(),
            buffered: 0,
            chunk_rows: self.chunk_rows,
            rows: 0,
        })
    }

    /// Finish the row stream (if any), write import references, commit.
    pub async fn commit(
        &mut self,
        stream: Option<CopyStream>,
        refs: &[ImportRef],
    ) -> Result<LoadOutcome> {
        self.begin().await?;
        let rows = match stream {
            Some(s) => s.finish().await?,
            None => 0,
        };
        let refs_written = self.write_refs(refs).await?;
        self.target.execute("COMMIT").await?;
        self.in_transaction = false;
        debug!(rows, refs = refs_written, "bulk load committed");
        Ok(LoadOutcome {
            rows,
            refs: refs_written,
        })
    }

    /// Abandon the phase. Dropping an unfinished COPY aborts it server-side.
    pub async fn rollback(&mut self, stream: Option<CopyStream>) {
        drop(stream);
        if self.in_transaction {
            if let Err(e) = self.target.execute("ROLLBACK").await {
                warn!(error = %e, "rollback failed");
            }
            self.in_transaction = false;
        }
    }

    /// Convenience for callers that already hold every row of a load.
    pub async fn load<R: CopyRecord>(&mut self, rows: &[R], refs: &[ImportRef]) -> Result<LoadOutcome> {
        let mut stream = self.open(R::TABLE, R::COLUMNS).await?;
        for row in rows {
            if let Err(e) = stream.write(row).await {
                self.rollback(Some(stream)).await;
                return Err(e);
            }
        }
        match self.commit(Some(stream), refs).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.rollback(None).await;
                Err(e)
            }
        }
    }

    async fn write_refs(&mut self, refs: &[ImportRef]) -> Result<u64> {
        let now = Utc::now();
        let mut total = 0;
        for entity in Entity::ALL {
            let mine: Vec<&ImportRef> = refs.iter().filter(|r| r.entity == entity).collect();
            if mine.is_empty() {
                continue;
            }
            let (table, statement) = match entity.import_ref_store() {
                ImportRefStore::CustomField { table, fk } => (
                    table,
                    copy_statement(table, &[fk, "name", "value", "created_at", "updated_at"]),
                ),
                ImportRefStore::SideTable => (
                    IMPORT_REFERENCES_TABLE,
                    copy_statement(
                        IMPORT_REFERENCES_TABLE,
                        &["entity_type", "legacy_id", "new_id", "created_at"],
                    ),
                ),
            };
            let mut sink = self
                .target
                .copy_in(&statement)
                .await
                .with_context(|| format!("opening COPY into {table}"))?;
            let mut buf = String::new();
            let mut line = CopyLine::new();
            for r in mine {
                match entity.import_ref_store() {
                    ImportRefStore::CustomField { .. } => {
                        line.push(&r.new_id)
                            .push(IMPORT_ID_FIELD)
                            .push(&r.legacy_id.to_string())
                            .push(&now)
                            .push(&now);
                    }
                    ImportRefStore::SideTable => {
                        line.push(entity.as_str())
                            .push(&r.legacy_id)
                            .push(&r.new_id)
                            .push(&now);
                    }
                }
                buf.push_str(&line.take());
            }
            sink.send(Bytes::from(buf))
                .await
                .with_context(|| format!("COPY into {table} failed"))?;
            total += sink.finish().await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::testing::MemoryCopyTarget;
    use chrono::TimeZone;

    struct Pair(i64, Option<String>);

    impl CopyRecord for Pair {
        const TABLE: &'static str = "pairs";
        const COLUMNS: &'static [&'static str] = &["id", "label"];
        fn encode(&self, line: &mut CopyLine) {
            line.push(&self.0).push(&self.1);
        }
    }

    #[test]
    fn encodes_text_format_fields() {
        let mut line = CopyLine::new();
        let ts = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        line.push("a\tb\\c\nd")
            .push(&None::<i64>)
            .push(&Some(String::new()))
            .push(&true)
            .push(&ts);
        assert_eq!(
            line.take(),
            "a\\tb\\\\c\\nd\t\\N\t\tt\t2020-01-02 03:04:05.000000+00\n"
        );
        assert_eq!(line.fields(), 0);
    }

    #[test]
    fn quotes_column_names() {
        assert_eq!(
            copy_statement("user_emails", &["id", "primary"]),
            "COPY user_emails (\"id\", \"primary\") FROM STDIN"
        );
    }

    #[tokio::test]
    async fn load_writes_rows_then_refs_in_one_transaction() {
        let target = MemoryCopyTarget::default();
        let mut loader = BulkLoader::new(target.clone(), 1);
        let rows = vec![Pair(1, Some("x".into())), Pair(2, None)];
        let refs = vec![ImportRef::new(Entity::Tag, 7, 1)];
        let outcome = loader.load(&rows, &refs).await.unwrap();
        assert_eq!(outcome, LoadOutcome { rows: 2, refs: 1 });
        assert_eq!(target.lines("pairs"), vec!["1\tx", "2\t\\N"]);
        let side = target.lines("import_references");
        assert_eq!(side.len(), 1);
        assert!(side[0].starts_with("tag\t7\t1\t"));
        let stmts = target.statements();
        assert_eq!(stmts.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(stmts.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn failed_copy_rolls_back() {
        let target = MemoryCopyTarget::default();
        target.fail_table("pairs");
        let mut loader = BulkLoader::new(target.clone(), 1);
        let err = loader.load(&[Pair(1, None)], &[]).await;
        assert!(err.is_err());
        assert!(target.lines("pairs").is_empty());
        assert_eq!(target.statements().last().map(String::as_str), Some("ROLLBACK"));
    }
}
