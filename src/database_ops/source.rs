//! Read-only legacy source connections and dynamically typed rows.
//!
//! Every phase query is streamed with `fetch`, so a phase holds one row at a
//! time no matter how large the legacy table is.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use encoding_rs::Encoding;
use futures::{stream::BoxStream, StreamExt};
use indexmap::IndexMap;
use sqlx::{
    mysql::{MySqlPool, MySqlPoolOptions, MySqlRow},
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow},
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Column, Row, TypeInfo,
};
use std::str::FromStr;
use tracing::info;

use crate::normalization::text::decode_legacy;

#[derive(Debug, Clone, PartialEq)]
pub enum LegacyValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Bool(bool),
}

impl From<i64> for LegacyValue {
    fn from(v: i64) -> Self {
        LegacyValue::Int(v)
    }
}

impl From<&str> for LegacyValue {
    fn from(v: &str) -> Self {
        LegacyValue::Text(v.to_string())
    }
}

impl From<String> for LegacyValue {
    fn from(v: String) -> Self {
        LegacyValue::Text(v)
    }
}

impl From<bool> for LegacyValue {
    fn from(v: bool) -> Self {
        LegacyValue::Bool(v)
    }
}

impl<T: Into<LegacyValue>> From<Option<T>> for LegacyValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(LegacyValue::Null, Into::into)
    }
}

/// One legacy row, columns keyed by lowercase name in select order.
#[derive(Debug, Clone, Default)]
pub struct LegacyRow {
    cols: IndexMap<String, LegacyValue>,
    charset: Option<&'static Encoding>,
}

fn parse_time_text(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() || s.starts_with("0000-00-00") {
        return None;
    }
    if let Ok(secs) = s.parse::<i64>() {
        return epoch(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Unix seconds; zero and negative values mean "never".
fn epoch(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

impl LegacyRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<LegacyValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<LegacyValue>) {
        self.cols.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&LegacyValue> {
        self.cols.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        !matches!(self.get(name), None | Some(LegacyValue::Null))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            LegacyValue::Int(v) => Some(*v),
            LegacyValue::Float(v) => Some(*v as i64),
            LegacyValue::Bool(v) => Some(i64::from(*v)),
            LegacyValue::Text(s) => s.trim().parse().ok(),
            LegacyValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            LegacyValue::Null | LegacyValue::Time(_) => None,
        }
    }

    pub fn req_int(&self, name: &str) -> Result<i64> {
        self.int(name)
            .ok_or_else(|| anyhow!("column `{name}` is missing or not an integer"))
    }

    /// Text value, decoding raw bytes with the source charset.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            LegacyValue::Text(s) => Some(s.clone()),
            LegacyValue::Bytes(b) => Some(decode_legacy(b, self.charset)),
            LegacyValue::Int(v) => Some(v.to_string()),
            LegacyValue::Float(v) => Some(v.to_string()),
            LegacyValue::Bool(v) => Some(v.to_string()),
            LegacyValue::Time(t) => Some(t.to_rfc3339()),
            LegacyValue::Null => None,
        }
    }

    /// Trimmed text, `None` when blank.
    pub fn text_nonempty(&self, name: &str) -> Option<String> {
        self.text(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn bool(&self, name: &str) -> bool {
        match self.get(name) {
            Some(LegacyValue::Bool(v)) => *v,
            Some(LegacyValue::Int(v)) => *v != 0,
            Some(LegacyValue::Float(v)) => *v != 0.0,
            Some(LegacyValue::Text(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true" | "yes" | "y")
            }
            _ => false,
        }
    }

    /// Timestamps may arrive as native values, unix seconds or text.
    pub fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name)? {
            LegacyValue::Time(t) => Some(*t),
            LegacyValue::Int(v) => epoch(*v),
            LegacyValue::Float(v) => epoch(*v as i64),
            LegacyValue::Text(s) => parse_time_text(s),
            LegacyValue::Bytes(b) => parse_time_text(std::str::from_utf8(b).ok()?),
            LegacyValue::Null | LegacyValue::Bool(_) => None,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cols.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Float,
    Bool,
    Time,
    Bytes,
    Text,
}

fn kind_of(type_name: &str) -> Kind {
    let t = type_name.to_ascii_uppercase();
    if t.contains("BOOL") {
        Kind::Bool
    } else if t.contains("INT") && !t.contains("INTERVAL") {
        Kind::Int
    } else if t.contains("FLOAT") || t.contains("DOUBLE") || t.contains("REAL") {
        Kind::Float
    } else if t.contains("TIME") || t.contains("DATE") {
        Kind::Time
    } else if t.contains("BLOB") || t.contains("BINARY") || t == "BYTEA" {
        Kind::Bytes
    } else {
        Kind::Text
    }
}

fn naive_date(d: NaiveDate) -> LegacyValue {
    d.and_hms_opt(0, 0, 0)
        .map_or(LegacyValue::Null, |n| LegacyValue::Time(Utc.from_utc_datetime(&n)))
}

fn naive_time(n: NaiveDateTime) -> LegacyValue {
    LegacyValue::Time(Utc.from_utc_datetime(&n))
}

/// First type in the list that decodes the column wins; NULL stays `Null`.
macro_rules! try_decode {
    ($row:expr, $i:expr, $($ty:ty => $wrap:expr),+ $(,)?) => {{
        let mut value = None;
        $(
            if value.is_none() {
                match $row.try_get::<Option<$ty>, _>($i) {
                    Ok(Some(v)) => value = Some($wrap(v)),
                    Ok(None) => value = Some(LegacyValue::Null),
                    Err(_) => {}
                }
            }
        )+
        value
    }};
}

fn decode_mysql(row: &MySqlRow, charset: Option<&'static Encoding>) -> LegacyRow {
    let mut out = LegacyRow {
        cols: IndexMap::with_capacity(row.len()),
        charset,
    };
    for (i, col) in row.columns().iter().enumerate() {
        let decoded = match kind_of(col.type_info().name()) {
            Kind::Int => try_decode!(row, i, i64 => LegacyValue::Int, u64 => |v: u64| LegacyValue::Int(v as i64)),
            Kind::Float => try_decode!(row, i, f64 => LegacyValue::Float, f32 => |v: f32| LegacyValue::Float(f64::from(v))),
            Kind::Bool => try_decode!(row, i, bool => LegacyValue::Bool, i64 => LegacyValue::Int),
            Kind::Time => try_decode!(row, i, DateTime<Utc> => LegacyValue::Time, NaiveDateTime => naive_time, NaiveDate => naive_date),
            Kind::Bytes => try_decode!(row, i, Vec<u8> => LegacyValue::Bytes),
            Kind::Text => None,
        };
        let value = decoded
            .or_else(|| try_decode!(row, i, String => LegacyValue::Text, Vec<u8> => LegacyValue::Bytes))
            .unwrap_or(LegacyValue::Null);
        out.cols.insert(col.name().to_ascii_lowercase(), value);
    }
    out
}

fn decode_sqlite(row: &SqliteRow, charset: Option<&'static Encoding>) -> LegacyRow {
    let mut out = LegacyRow {
        cols: IndexMap::with_capacity(row.len()),
        charset,
    };
    for (i, col) in row.columns().iter().enumerate() {
        let decoded = match kind_of(col.type_info().name()) {
            Kind::Int => try_decode!(row, i, i64 => LegacyValue::Int),
            Kind::Float => try_decode!(row, i, f64 => LegacyValue::Float),
            Kind::Bool => try_decode!(row, i, bool => LegacyValue::Bool, i64 => LegacyValue::Int),
            Kind::Time => try_decode!(row, i, DateTime<Utc> => LegacyValue::Time, NaiveDateTime => naive_time, i64 => LegacyValue::Int),
            Kind::Bytes => try_decode!(row, i, Vec<u8> => LegacyValue::Bytes),
            Kind::Text => None,
        };
        let value = decoded
            .or_else(|| {
                try_decode!(row, i,
                    String => LegacyValue::Text,
                    i64 => LegacyValue::Int,
                    f64 => LegacyValue::Float,
                    Vec<u8> => LegacyValue::Bytes,
                )
            })
            .unwrap_or(LegacyValue::Null);
        out.cols.insert(col.name().to_ascii_lowercase(), value);
    }
    out
}

fn decode_pg(row: &PgRow, charset: Option<&'static Encoding>) -> LegacyRow {
    let mut out = LegacyRow {
        cols: IndexMap::with_capacity(row.len()),
        charset,
    };
    for (i, col) in row.columns().iter().enumerate() {
        let decoded = match kind_of(col.type_info().name()) {
            Kind::Int => try_decode!(row, i, i64 => LegacyValue::Int, i32 => |v: i32| LegacyValue::Int(i64::from(v)), i16 => |v: i16| LegacyValue::Int(i64::from(v))),
            Kind::Float => try_decode!(row, i, f64 => LegacyValue::Float, f32 => |v: f32| LegacyValue::Float(f64::from(v))),
            Kind::Bool => try_decode!(row, i, bool => LegacyValue::Bool),
            Kind::Time => try_decode!(row, i, DateTime<Utc> => LegacyValue::Time, NaiveDateTime => naive_time, NaiveDate => naive_date),
            Kind::Bytes => try_decode!(row, i, Vec<u8> => LegacyValue::Bytes),
            Kind::Text => None,
        };
        let value = decoded
            .or_else(|| {
                try_decode!(row, i,
                    String => LegacyValue::Text,
                    serde_json::Value => |v: serde_json::Value| LegacyValue::Text(v.to_string()),
                )
            })
            .unwrap_or(LegacyValue::Null);
        out.cols.insert(col.name().to_ascii_lowercase(), value);
    }
    out
}

#[derive(Debug, Clone)]
pub enum SourceDb {
    MySql(MySqlPool),
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl SourceDb {
    pub async fn connect(url: &str) -> Result<Self> {
        let scheme = url::Url::parse(url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_default();
        let db = match scheme.as_str() {
            "mysql" | "mariadb" => SourceDb::MySql(
                MySqlPoolOptions::new()
                    .max_connections(2)
                    .connect(url)
                    .await
                    .context("connecting to legacy mysql source")?,
            ),
            "sqlite" => {
                let opts = SqliteConnectOptions::from_str(url)
                    .context("parsing sqlite source url")?
                    .read_only(true);
                SourceDb::Sqlite(
                    SqlitePoolOptions::new()
                        .max_connections(2)
                        .connect_with(opts)
                        .await
                        .context("opening sqlite source")?,
                )
            }
            "postgres" | "postgresql" => {
                let opts = PgConnectOptions::from_str(url)
                    .context("parsing postgres source url")?
                    .statement_cache_capacity(0);
                SourceDb::Postgres(
                    PgPoolOptions::new()
                        .max_connections(2)
                        .connect_with(opts)
                        .await
                        .context("connecting to postgres source")?,
                )
            }
            other => return Err(anyhow!("unsupported source scheme `{other}`")),
        };
        info!(kind = db.kind(), "connected to legacy source");
        Ok(db)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceDb::MySql(_) => "mysql",
            SourceDb::Sqlite(_) => "sqlite",
            SourceDb::Postgres(_) => "postgres",
        }
    }

    /// Forward-only stream over a query's rows.
    pub fn stream<'a>(
        &'a self,
        sql: &'a str,
        charset: Option<&'static Encoding>,
    ) -> BoxStream<'a, Result<LegacyRow>> {
        match self {
            SourceDb::MySql(pool) => sqlx::query(sql)
                .fetch(pool)
                .map(move |r| -> Result<LegacyRow> { Ok(decode_mysql(&r?, charset)) })
                .boxed(),
            SourceDb::Sqlite(pool) => sqlx::query(sql)
                .fetch(pool)
                .map(move |r| -> Result<LegacyRow> { Ok(decode_sqlite(&r?, charset)) })
                .boxed(),
            SourceDb::Postgres(pool) => sqlx::query(sql)
                .fetch(pool)
                .map(move |r| -> Result<LegacyRow> { Ok(decode_pg(&r?, charset)) })
                .boxed(),
        }
    }

    /// Row count of a phase query, for progress totals.
    pub async fn count(&self, sql: &str) -> Result<u64> {
        let wrapped = format!("SELECT COUNT(*) FROM ({sql}) AS phase_rows");
        let n: i64 = match self {
            SourceDb::MySql(pool) => sqlx::query_scalar(&wrapped).fetch_one(pool).await?,
            SourceDb::Sqlite(pool) => sqlx::query_scalar(&wrapped).fetch_one(pool).await?,
            SourceDb::Postgres(pool) => sqlx::query_scalar(&wrapped).fetch_one(pool).await?,
        };
        Ok(n.max(0) as u64)
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let n: i64 = match self {
            SourceDb::MySql(pool) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM information_schema.tables
                      WHERE table_schema = DATABASE() AND table_name = ?",
                )
                .bind(table)
                .fetch_one(pool)
                .await?
            }
            SourceDb::Sqlite(pool) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                )
                .bind(table)
                .fetch_one(pool)
                .await?
            }
            SourceDb::Postgres(pool) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM information_schema.tables
                      WHERE table_schema = current_schema() AND table_name = $1",
                )
                .bind(table)
                .fetch_one(pool)
                .await?
            }
        };
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn timestamps_from_epoch_and_text() {
        let row = LegacyRow::new()
            .with("a", 1_300_000_000i64)
            .with("b", 0i64)
            .with("c", "2011-03-13 07:06:40")
            .with("d", "0000-00-00 00:00:00");
        let expected = Utc.timestamp_opt(1_300_000_000, 0).single();
        assert_eq!(row.time("a"), expected);
        assert_eq!(row.time("b"), None);
        assert_eq!(row.time("c"), expected);
        assert_eq!(row.time("d"), None);
        assert_eq!(row.time("missing"), None);
    }

    #[test]
    fn loose_ints_and_bools() {
        let row = LegacyRow::new()
            .with("n", " 42 ")
            .with("flag", "t")
            .with("off", 0i64)
            .with("none", None::<i64>);
        assert_eq!(row.int("n"), Some(42));
        assert!(row.bool("flag"));
        assert!(!row.bool("off"));
        assert!(!row.has("none"));
        assert!(row.req_int("none").is_err());
    }

    #[test]
    fn bytes_use_source_charset() {
        let mut row = LegacyRow::new();
        row.charset = Some(encoding_rs::WINDOWS_1252);
        row.set("title", LegacyValue::Bytes(vec![b'c', b'a', b'f', 0xE9]));
        assert_eq!(row.text("title").as_deref(), Some("café"));
    }

    #[test]
    fn type_names_map_to_kinds() {
        assert_eq!(kind_of("INT UNSIGNED"), Kind::Int);
        assert_eq!(kind_of("INT8"), Kind::Int);
        assert_eq!(kind_of("BOOLEAN"), Kind::Bool);
        assert_eq!(kind_of("DATETIME"), Kind::Time);
        assert_eq!(kind_of("TIMESTAMPTZ"), Kind::Time);
        assert_eq!(kind_of("MEDIUMBLOB"), Kind::Bytes);
        assert_eq!(kind_of("VARCHAR"), Kind::Text);
        assert_eq!(kind_of("INTERVAL"), Kind::Text);
    }

    #[tokio::test]
    async fn streams_sqlite_rows() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE users (id INTEGER, username TEXT, admin BOOLEAN, created_at DATETIME)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users VALUES (1, 'bob', 1, '2020-01-02 03:04:05'), (2, NULL, 0, NULL)")
            .execute(&pool)
            .await
            .unwrap();
        let db = SourceDb::Sqlite(pool);
        assert!(db.table_exists("users").await.unwrap());
        assert!(!db.table_exists("posts").await.unwrap());
        let sql = "SELECT id, username, admin, created_at FROM users ORDER BY id";
        assert_eq!(db.count(sql).await.unwrap(), 2);
        let rows: Vec<LegacyRow> = db.stream(sql, None).try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].int("id"), Some(1));
        assert_eq!(rows[0].text("username").as_deref(), Some("bob"));
        assert!(rows[0].bool("admin"));
        assert_eq!(
            rows[0].time("created_at"),
            Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).single()
        );
        assert_eq!(rows[1].text("username"), None);
        assert_eq!(rows[1].time("created_at"), None);
    }
}
