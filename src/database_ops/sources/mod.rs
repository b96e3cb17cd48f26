//! Legacy forum adapters.
//!
//! An adapter knows one legacy schema: for every phase it supplies a query
//! whose columns use the canonical names the transforms read, plus the markup
//! dialect rules its bodies need before the shared bbcode conversion.

use anyhow::{bail, Result};
use clap::ValueEnum;
use tracing::info;

use super::db::Db;
use super::etl::Phase;
use super::source::{LegacyRow, SourceDb};
use crate::normalization::bbcode::Rule;

pub mod generic;
pub mod phpbb;
pub mod vanilla;
pub mod vbulletin;
pub mod vbulletin5;

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Row query for a phase; `None` when the legacy schema has no such data.
    fn query(&self, phase: Phase) -> Option<String>;

    /// Table a phase reads that older installs may not have. The phase is
    /// skipped when it is missing.
    fn optional_table(&self, _phase: Phase) -> Option<String> {
        None
    }

    /// Tables that must exist for the adapter to run at all.
    fn required_tables(&self) -> Vec<String> {
        Vec::new()
    }

    fn dialect(&self) -> Result<Vec<Rule>> {
        Ok(Vec::new())
    }

    fn convert_markup(&self) -> bool {
        true
    }

    /// Whether bodies are stored HTML-escaped.
    fn decode_entities(&self) -> bool {
        true
    }

    /// Natural-key dedup against the destination.
    fn merge(&self) -> bool {
        false
    }

    /// Fill in the `path` column of an upload row, relative to the uploads root.
    fn locate_upload(&self, _row: &mut LegacyRow) {}

    async fn preflight(&self, source: &SourceDb, _db: &Db) -> Result<()> {
        let mut missing = Vec::new();
        for table in self.required_tables() {
            if !source.table_exists(&table).await? {
                missing.push(table);
            }
        }
        if !missing.is_empty() {
            bail!(
                "{} source is missing required tables: {} (check TABLE_PREFIX)",
                self.name(),
                missing.join(", ")
            );
        }
        info!(target: "preflight", adapter = self.name(), source = source.kind(), "source schema looks usable");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, ValueEnum)]
pub enum AdapterKind {
    #[value(alias = "phpbb3")]
    Phpbb,
    #[value(name = "vbulletin", alias = "vbulletin3", alias = "vb3")]
    Vbulletin,
    #[value(alias = "vb5")]
    Vbulletin5,
    Vanilla,
    #[value(alias = "sqlite")]
    Generic,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 5] = [
        AdapterKind::Phpbb,
        AdapterKind::Vbulletin,
        AdapterKind::Vbulletin5,
        AdapterKind::Vanilla,
        AdapterKind::Generic,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AdapterKind::Phpbb => "phpbb",
            AdapterKind::Vbulletin => "vbulletin",
            AdapterKind::Vbulletin5 => "vbulletin5",
            AdapterKind::Vanilla => "vanilla",
            AdapterKind::Generic => "generic",
        }
    }

    pub fn display(self) -> &'static str {
        match self {
            AdapterKind::Phpbb => "phpBB 3.x (MySQL)",
            AdapterKind::Vbulletin => "vBulletin 3.x / 4.x (MySQL)",
            AdapterKind::Vbulletin5 => "vBulletin 5.x node schema (MySQL)",
            AdapterKind::Vanilla => "Vanilla Forums 2.x (MySQL)",
            AdapterKind::Generic => "Generic SQLite staging database",
        }
    }

    pub fn default_prefix(self) -> &'static str {
        match self {
            AdapterKind::Phpbb => "phpbb_",
            AdapterKind::Vanilla => "GDN_",
            AdapterKind::Vbulletin | AdapterKind::Vbulletin5 | AdapterKind::Generic => "",
        }
    }
}

/// Build the adapter for `kind`. The generic adapter inspects the source to
/// learn which optional staging tables exist.
pub async fn build_adapter(
    kind: AdapterKind,
    prefix: Option<String>,
    source: &SourceDb,
) -> Result<Box<dyn SourceAdapter>> {
    let prefix = prefix.unwrap_or_else(|| kind.default_prefix().to_string());
    Ok(match kind {
        AdapterKind::Phpbb => Box::new(phpbb::PhpbbAdapter::new(prefix)),
        AdapterKind::Vbulletin => Box::new(vbulletin::VbulletinAdapter::new(prefix)),
        AdapterKind::Vbulletin5 => Box::new(vbulletin5::Vbulletin5Adapter::new(prefix)),
        AdapterKind::Vanilla => Box::new(vanilla::VanillaAdapter::new(prefix)),
        AdapterKind::Generic => Box::new(generic::GenericAdapter::inspect(source).await?),
    })
}

/// Expand `{p}` to the table prefix.
pub(crate) fn prefixed(template: &str, prefix: &str) -> String {
    template.replace("{p}", prefix)
}

/// vBulletin-style attachment path: the owner id split into one directory per
/// digit, then `<file id>.attach`.
pub(crate) fn digit_path(owner: i64, file_id: i64) -> String {
    let mut path = String::new();
    for c in owner.unsigned_abs().to_string().chars() {
        path.push(c);
        path.push('/');
    }
    path.push_str(&format!("{file_id}.attach"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_expand_everywhere() {
        assert_eq!(
            prefixed("SELECT * FROM {p}users u JOIN {p}posts p", "phpbb_"),
            "SELECT * FROM phpbb_users u JOIN phpbb_posts p"
        );
    }

    #[test]
    fn attachment_paths_split_owner_digits() {
        assert_eq!(digit_path(105, 33), "1/0/5/33.attach");
        assert_eq!(digit_path(0, 7), "0/7.attach");
    }

    #[test]
    fn labels_parse_back() {
        for kind in AdapterKind::ALL {
            assert_eq!(AdapterKind::from_str(kind.label(), true), Ok(kind));
        }
        assert_eq!(AdapterKind::from_str("vb5", true), Ok(AdapterKind::Vbulletin5));
    }
}
