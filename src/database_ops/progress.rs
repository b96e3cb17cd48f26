use std::cmp::Reverse;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::util::env::env_parse;

const MIN_LOG_GAP: Duration = Duration::from_millis(200);

pub fn progress_interval() -> usize {
    env_parse::<usize>("PROGRESS_INTERVAL", 10_000).max(1)
}

/// Per-phase row counter logging processed/remaining/rate on target `progress`.
#[derive(Debug, Clone)]
pub struct Progress {
    label: String,
    total: Option<u64>,
    every: u64,
    start: Instant,
    last_log: Instant,
    processed: u64,
}

impl Progress {
    pub fn new<L: Into<String>>(label: L, total: Option<u64>) -> Self {
        Self::with_interval(label, total, progress_interval() as u64)
    }

    pub fn with_interval<L: Into<String>>(label: L, total: Option<u64>, every: u64) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total,
            every: every.max(1),
            start: now,
            last_log: now,
            processed: 0,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn tick(&mut self, n: u64) {
        self.processed += n;
        if self.processed == n || self.processed % self.every == 0 {
            self.log(false);
        }
    }

    pub fn finish(&mut self) {
        self.log(true);
    }

    fn log(&mut self, done: bool) {
        let now = Instant::now();
        if !done && now.duration_since(self.last_log) < MIN_LOG_GAP {
            return;
        }
        self.last_log = now;

        let elapsed = now.duration_since(self.start).as_secs_f64().max(0.001);
        let rate = self.processed as f64 / elapsed;
        let Some(total) = self.total.filter(|&t| t > 0) else {
            if done {
                info!(target: "progress", label = %self.label, processed = self.processed, rate = %format!("{rate:.1}/s"), took = %format!("{elapsed:.1}s"), "done");
            } else {
                info!(target: "progress", label = %self.label, processed = self.processed, rate = %format!("{rate:.1}/s"), "progress");
            }
            return;
        };
        let remaining = total.saturating_sub(self.processed);
        let pct = 100.0 * self.processed as f64 / total as f64;
        if done {
            info!(target: "progress", label = %self.label, processed = self.processed, remaining, total, pct = %format!("{pct:.1}"), rate = %format!("{rate:.1}/s"), took = %format!("{elapsed:.1}s"), "done");
        } else {
            let eta = if self.processed > 0 {
                remaining as f64 * elapsed / self.processed as f64
            } else {
                0.0
            };
            info!(target: "progress", label = %self.label, processed = self.processed, remaining, total, pct = %format!("{pct:.1}"), rate = %format!("{rate:.1}/s"), eta = %format!("{eta:.1}s"), "progress");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub name: String,
    #[serde(rename = "took_ms")]
    pub elapsed_ms: f64,
    pub success: bool,
}

impl StageTiming {
    pub fn new(name: &str, elapsed: Duration, success: bool) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            success,
        }
    }
}

/// Stage timings sorted slowest first, logged on target `metrics`.
pub fn emit_stage_summary(timings: &[StageTiming]) {
    if timings.is_empty() {
        return;
    }
    let mut timings = timings.to_vec();
    timings.sort_by_key(|t| Reverse((t.elapsed_ms * 1000.0) as u64));
    let total: f64 = timings.iter().map(|t| t.elapsed_ms).sum();
    info!(
        target: "metrics",
        stages = timings.len(),
        total_ms = format!("{total:.2}"),
        "import stage timing summary"
    );
    for timing in timings {
        let pct = if total <= 0.0 {
            0.0
        } else {
            timing.elapsed_ms / total * 100.0
        };
        info!(
            target: "metrics",
            stage = %timing.name,
            took_ms = format!("{:.2}", timing.elapsed_ms),
            pct = format!("{pct:.1}"),
            success = timing.success,
            "stage timing detail"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_ticks() {
        let mut p = Progress::with_interval("posts", Some(10), 3);
        for _ in 0..7 {
            p.tick(1);
        }
        p.finish();
        assert_eq!(p.processed(), 7);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut p = Progress::with_interval("users", None, 0);
        p.tick(5);
        assert_eq!(p.processed(), 5);
    }

    #[test]
    fn timing_serializes_took_ms() {
        let t = StageTiming::new("posts", Duration::from_millis(1500), true);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["took_ms"], 1500.0);
        assert_eq!(json["name"], "posts");
    }
}
