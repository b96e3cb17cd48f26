//! In-memory COPY target for pipeline, loader and upload tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::context::{MigrationContext, ALLOCATED_TABLES};
use super::copy::{CopySink, CopyTarget};
use super::entity::{Entity, ImportRefStore, IMPORT_ID_FIELD, IMPORT_REFERENCES_TABLE};

#[derive(Debug, Default)]
struct State {
    statements: Vec<String>,
    committed: HashMap<String, Vec<String>>,
    pending: HashMap<String, Vec<String>>,
    failing: Vec<String>,
    /// `(table, text)`: a chunk for `table` containing `text` fails.
    failing_rows: Vec<(String, String)>,
}

/// Records statements and keeps COPY lines per table with BEGIN/COMMIT/ROLLBACK
/// semantics. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCopyTarget {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryCopyTarget {
    /// Make every COPY into `table` fail on its first write.
    pub fn fail_table(&self, table: &str) {
        lock(&self.state).failing.push(table.to_string());
    }

    /// Fail the COPY into `table` once a row containing `text` is sent.
    pub fn fail_row_containing(&self, table: &str, text: &str) {
        lock(&self.state)
            .failing_rows
            .push((table.to_string(), text.to_string()));
    }

    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.failing.clear();
        state.failing_rows.clear();
    }

    /// Committed lines for a table, without the trailing newline.
    pub fn lines(&self, table: &str) -> Vec<String> {
        lock(&self.state)
            .committed
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).statements.clone()
    }

    /// Integer in column `col` of every committed line of `table`.
    pub fn column(&self, table: &str, col: usize) -> Vec<i64> {
        self.lines(table)
            .iter()
            .filter_map(|l| l.split('\t').nth(col)?.parse().ok())
            .collect()
    }

    /// Committed `(legacy_id, new_id)` references of one entity.
    pub fn import_refs(&self, entity: Entity) -> Vec<(i64, i64)> {
        match entity.import_ref_store() {
            ImportRefStore::CustomField { table, .. } => self
                .lines(table)
                .iter()
                .filter_map(|l| {
                    let f: Vec<&str> = l.split('\t').collect();
                    (f.get(1) == Some(&IMPORT_ID_FIELD))
                        .then(|| Some((f.get(2)?.parse().ok()?, f.first()?.parse().ok()?)))
                        .flatten()
                })
                .collect(),
            ImportRefStore::SideTable => self
                .lines(IMPORT_REFERENCES_TABLE)
                .iter()
                .filter_map(|l| {
                    let f: Vec<&str> = l.split('\t').collect();
                    (f.first() == Some(&entity.as_str()))
                        .then(|| Some((f.get(1)?.parse().ok()?, f.get(2)?.parse().ok()?)))
                        .flatten()
                })
                .collect(),
        }
    }

    /// What a fresh run would preload from this destination: references,
    /// id high-water marks and imported post numbers.
    pub fn reload(&self, ctx: &mut MigrationContext) {
        for entity in Entity::ALL {
            for (legacy_id, new_id) in self.import_refs(entity) {
                ctx.registry.insert(entity, legacy_id, new_id);
            }
        }
        for &table in ALLOCATED_TABLES {
            let max = self.column(table, 0).into_iter().max().unwrap_or(0);
            ctx.registry.seed_table(table, max);
        }
        for line in self.lines("posts") {
            let f: Vec<i64> = line
                .split('\t')
                .take(5)
                .filter_map(|v| v.parse().ok())
                .collect();
            if let [id, _, _, topic_id, post_number] = f[..] {
                ctx.posts.insert(id, (topic_id, post_number));
                let highest = ctx.topic_post_numbers.entry(topic_id).or_insert(0);
                *highest = (*highest).max(post_number);
            }
        }
    }

    /// Natural keys `(a, b, 0)` from two integer columns of `table`.
    pub fn keys(&self, table: &str, a: usize, b: Option<usize>) -> HashSet<(i64, i64, i64)> {
        self.lines(table)
            .iter()
            .filter_map(|l| {
                let f: Vec<&str> = l.split('\t').collect();
                let first = f.get(a)?.parse().ok()?;
                let second = match b {
                    Some(b) => f.get(b)?.parse().ok()?,
                    None => 0,
                };
                Some((first, second, 0))
            })
            .collect()
    }
}

fn table_of(statement: &str) -> String {
    statement
        .trim_start_matches("COPY ")
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

struct MemorySink {
    state: Arc<Mutex<State>>,
    table: String,
    lines: Vec<String>,
}

#[async_trait]
impl CopySink for MemorySink {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        let text = String::from_utf8_lossy(&chunk);
        let state = lock(&self.state);
        let bad_row = state
            .failing_rows
            .iter()
            .any(|(t, needle)| *t == self.table && text.contains(needle.as_str()));
        if bad_row || state.failing.contains(&self.table) {
            return Err(anyhow!("connection reset while copying into {}", self.table));
        }
        drop(state);
        self.lines
            .extend(text.lines().map(ToString::to_string));
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let n = self.lines.len() as u64;
        let mut state = lock(&self.state);
        state
            .pending
            .entry(self.table.clone())
            .or_default()
            .extend(self.lines);
        Ok(n)
    }
}

#[async_trait]
impl CopyTarget for MemoryCopyTarget {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());
        match sql.trim() {
            "BEGIN" | "ROLLBACK" => state.pending.clear(),
            "COMMIT" => {
                let pending = std::mem::take(&mut state.pending);
                for (table, lines) in pending {
                    state.committed.entry(table).or_default().extend(lines);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn copy_in(&mut self, statement: &str) -> Result<Box<dyn CopySink>> {
        lock(&self.state).statements.push(statement.to_string());
        Ok(Box::new(MemorySink {
            state: Arc::clone(&self.state),
            table: table_of(statement),
            lines: Vec::new(),
        }))
    }
}
