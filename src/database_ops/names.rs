//! Deterministic collision avoidance for names that must be unique
//! case-insensitively (usernames, group, category and tag names).

use std::collections::{HashMap, HashSet};

/// `bob` -> `bob_1`. The suffix always goes on the end, so `smith_1` -> `smith_1_1`.
pub fn with_suffix(base: &str, n: u64) -> String {
    format!("{base}_{n}")
}

/// Names already taken, compared lowercase. Names are never released.
#[derive(Debug, Default, Clone)]
pub struct NamePool {
    used: HashSet<String>,
    max_len: Option<usize>,
}

impl NamePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            used: HashSet::new(),
            max_len: Some(max_len),
        }
    }

    pub fn seed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.used
            .extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Claim `candidate`, or the first free `<lowercase candidate>_<n>` when
    /// it collides. Only the appended suffix is ever incremented.
    pub fn resolve(&mut self, candidate: &str) -> String {
        if !self.contains(candidate) {
            self.used.insert(candidate.to_lowercase());
            return candidate.to_string();
        }
        let base = candidate.to_lowercase();
        let mut n = 1u64;
        let name = loop {
            let name = self.fit(&base, n);
            if !self.contains(&name) {
                break name;
            }
            n += 1;
        };
        self.used.insert(name.clone());
        name
    }

    /// `base_n`, with `base` trimmed so the suffix survives `max_len`.
    fn fit(&self, base: &str, n: u64) -> String {
        let name = with_suffix(base, n);
        let Some(max) = self.max_len else {
            return name;
        };
        if name.chars().count() <= max {
            return name;
        }
        let suffix_len = name.chars().count() - base.chars().count();
        let keep = max.saturating_sub(suffix_len);
        let trimmed: String = base.chars().take(keep).collect();
        with_suffix(&trimmed, n)
    }
}

/// One [`NamePool`] per scope, e.g. category names per parent category.
#[derive(Debug, Default, Clone)]
pub struct ScopedNames {
    scopes: HashMap<Option<i64>, NamePool>,
}

impl ScopedNames {
    pub fn seed(&mut self, scope: Option<i64>, name: &str) {
        self.scopes.entry(scope).or_default().seed([name]);
    }

    pub fn resolve(&mut self, scope: Option<i64>, candidate: &str) -> String {
        self.scopes.entry(scope).or_default().resolve(candidate)
    }
}
