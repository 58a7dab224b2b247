//! Batch, suite and stage done/total counters.
//!
//! Counters only move forward inside a suite run. A result that arrives
//! without its `testStart` (lost across a reconnect) still counts, and grows
//! the total of a dynamically discovered stage so the stage never shows more
//! done than total. Pass/fail/skip totals come from `suiteEnd` summaries only.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::model::SuiteSummary;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub done: u64,
    pub total: u64,
}

impl Counter {
    fn reset(total: u64) -> Self {
        Self { done: 0, total }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub stage_index: u32,
    pub done: u64,
    pub total: u64,
    /// The stage was not announced at `suiteStart`; its total grows as tests show up.
    pub dynamic: bool,
}

/// Authoritative batch totals accumulated from `suiteEnd` summaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTotals {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: u64,
    pub duration_ms: u64,
    pub suites: u64,
}

impl BatchTotals {
    fn accumulate(&mut self, summary: &SuiteSummary) {
        self.passed = self.passed.saturating_add(summary.passed);
        self.failed = self.failed.saturating_add(summary.failed);
        self.skipped = self.skipped.saturating_add(summary.skipped);
        self.total = self.total.saturating_add(summary.total);
        self.duration_ms = self.duration_ms.saturating_add(summary.duration_ms);
        self.suites = self.suites.saturating_add(1);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub batch: Counter,
    pub totals: BatchTotals,
    pub current_suite: Option<String>,
    pub suite: Counter,
    pub stages: BTreeMap<u32, StageProgress>,
    pub finished: bool,
}

impl ProgressSnapshot {
    pub fn stage(&self, index: u32) -> Option<&StageProgress> {
        self.stages.get(&index)
    }
}

#[derive(Default)]
struct ProgressState {
    snapshot: ProgressSnapshot,
    started: HashSet<(String, String)>,
    completed: HashSet<(String, String)>,
    ended_suites: HashSet<String>,
}

impl ProgressState {
    /// Resolves the suite an event belongs to. `None` means the event is for
    /// another suite than the one in progress and must not move counters.
    fn attribute(&mut self, path: Option<&str>) -> Option<String> {
        let current = self.snapshot.current_suite.clone();
        match (path.filter(|p| !p.is_empty()), current) {
            (Some(path), Some(current)) if path != current => None,
            (Some(path), _) => {
                self.snapshot.current_suite.get_or_insert_with(|| path.to_string());
                Some(path.to_string())
            }
            (None, current) => Some(current.unwrap_or_default()),
        }
    }

    fn stage_mut(&mut self, index: u32) -> &mut StageProgress {
        self.snapshot
            .stages
            .entry(index)
            .or_insert(StageProgress {
                stage_index: index,
                done: 0,
                total: 0,
                dynamic: true,
            })
    }
}

/// Cloneable handle to one run's progress counters.
#[derive(Clone, Default)]
pub struct ProgressAggregator {
    inner: Arc<Mutex<ProgressState>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_start(&self, total: u64) {
        let mut state = self.lock();
        *state = ProgressState::default();
        state.snapshot.batch = Counter::reset(total);
    }

    pub fn suite_start(&self, path: &str, total: u64, stages: &BTreeMap<u32, u64>) {
        let mut state = self.lock();
        state.snapshot.current_suite = Some(path.to_string()).filter(|p| !p.is_empty());
        state.snapshot.suite = Counter::reset(total);
        state.snapshot.stages = stages
            .iter()
            .map(|(&index, &total)| {
                (
                    index,
                    StageProgress {
                        stage_index: index,
                        done: 0,
                        total,
                        dynamic: false,
                    },
                )
            })
            .collect();
        state.started.clear();
        state.completed.clear();
        state.ended_suites.remove(path);
    }

    pub fn test_start(&self, path: Option<&str>, name: &str, stage: u32) {
        let mut state = self.lock();
        let Some(suite) = state.attribute(path) else {
            debug!(path, name, "testStart for another suite; counters unchanged");
            return;
        };
        let key = (suite, name.to_string());
        if state.completed.contains(&key) || !state.started.insert(key) {
            return;
        }
        let stage = state.stage_mut(stage);
        if stage.dynamic {
            stage.total = stage.total.saturating_add(1);
        }
    }

    pub fn test_result(&self, path: Option<&str>, name: &str, stage: u32) {
        let mut state = self.lock();
        let Some(suite) = state.attribute(path) else {
            debug!(path, name, "result for another suite; counters unchanged");
            return;
        };
        let key = (suite, name.to_string());
        if state.completed.contains(&key) {
            debug!(name, "duplicate result ignored");
            return;
        }
        let had_started = state.started.remove(&key);
        state.completed.insert(key);

        let stage = state.stage_mut(stage);
        if !had_started && stage.dynamic {
            stage.total = stage.total.saturating_add(1);
        }
        stage.done = stage.done.saturating_add(1);
        state.snapshot.suite.done = state.snapshot.suite.done.saturating_add(1);
    }

    pub fn suite_end(&self, path: Option<&str>, summary: &SuiteSummary) {
        let mut state = self.lock();
        let key = path
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| state.snapshot.current_suite.clone())
            .unwrap_or_default();
        if !state.ended_suites.insert(key) {
            debug!(path, "duplicate suiteEnd ignored");
            return;
        }
        state.snapshot.totals.accumulate(summary);
        state.snapshot.batch.done = state.snapshot.batch.done.saturating_add(1);
    }

    pub fn batch_end(&self) {
        self.lock().snapshot.finished = true;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(entries: &[(u32, u64)]) -> BTreeMap<u32, u64> {
        entries.iter().copied().collect()
    }

    fn stage(progress: &ProgressAggregator, index: u32) -> StageProgress {
        *progress.snapshot().stage(index).expect("stage")
    }

    #[test]
    fn announced_stage_counts_started_results() {
        let progress = ProgressAggregator::new();
        progress.batch_start(1);
        progress.suite_start("p1", 2, &stages(&[(0, 2)]));
        progress.test_start(Some("p1"), "t1", 0);
        progress.test_result(Some("p1"), "t1", 0);
        progress.test_start(Some("p1"), "t2", 0);
        progress.test_result(Some("p1"), "t2", 0);

        let snapshot = progress.snapshot();
        assert_eq!(
            snapshot.stages[&0],
            StageProgress {
                stage_index: 0,
                done: 2,
                total: 2,
                dynamic: false
            }
        );
        assert_eq!(snapshot.suite, Counter { done: 2, total: 2 });
    }

    #[test]
    fn unannounced_result_without_start_grows_dynamic_stage() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p", 3, &stages(&[(0, 2)]));
        progress.test_result(Some("p"), "late", 2);
        assert_eq!(
            stage(&progress, 2),
            StageProgress {
                stage_index: 2,
                done: 1,
                total: 1,
                dynamic: true
            }
        );
        assert_eq!(progress.snapshot().suite.done, 1);
    }

    #[test]
    fn dynamic_stage_total_grows_at_start_time_only_once() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p", 2, &BTreeMap::new());
        progress.test_start(Some("p"), "a", 1);
        progress.test_start(Some("p"), "a", 1);
        progress.test_start(Some("p"), "b", 1);
        assert_eq!(stage(&progress, 1).total, 2);
        progress.test_result(Some("p"), "a", 1);
        let s = stage(&progress, 1);
        assert_eq!((s.done, s.total), (1, 2));
        progress.test_result(Some("p"), "b", 1);
        let s = stage(&progress, 1);
        assert_eq!((s.done, s.total), (2, 2));
    }

    #[test]
    fn result_without_start_on_announced_stage_keeps_total() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p", 2, &stages(&[(0, 2)]));
        progress.test_result(Some("p"), "a", 0);
        let s = stage(&progress, 0);
        assert_eq!((s.done, s.total, s.dynamic), (1, 2, false));
    }

    #[test]
    fn duplicate_results_are_not_double_counted() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p", 1, &stages(&[(0, 1)]));
        progress.test_start(Some("p"), "a", 0);
        progress.test_result(Some("p"), "a", 0);
        progress.test_result(Some("p"), "a", 0);
        progress.test_start(Some("p"), "a", 0);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.suite.done, 1);
        assert_eq!(snapshot.stages[&0].done, 1);
        assert_eq!(snapshot.stages[&0].total, 1);
    }

    #[test]
    fn events_for_another_suite_do_not_move_counters() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p2", 1, &stages(&[(0, 1)]));
        progress.test_result(Some("p1"), "stale", 0);
        assert_eq!(progress.snapshot().suite.done, 0);
        progress.test_result(None, "t", 0);
        assert_eq!(progress.snapshot().suite.done, 1);
    }

    #[test]
    fn suite_start_clears_previous_stages() {
        let progress = ProgressAggregator::new();
        progress.suite_start("p1", 1, &stages(&[(0, 1), (1, 3)]));
        progress.test_result(Some("p1"), "a", 0);
        progress.suite_start("p2", 4, &stages(&[(0, 4)]));
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.stages.len(), 1);
        assert_eq!(snapshot.stages[&0].done, 0);
        assert_eq!(snapshot.suite, Counter { done: 0, total: 4 });
        assert_eq!(snapshot.current_suite.as_deref(), Some("p2"));
    }

    #[test]
    fn batch_totals_come_from_suite_end_only() {
        let progress = ProgressAggregator::new();
        progress.batch_start(2);
        progress.suite_start("p1", 2, &stages(&[(0, 2)]));
        progress.test_result(Some("p1"), "a", 0);
        progress.test_result(Some("p1"), "b", 0);
        assert_eq!(progress.snapshot().totals, BatchTotals::default());

        let summary = SuiteSummary {
            passed: 1,
            failed: 1,
            skipped: 0,
            total: 2,
            duration_ms: 7,
        };
        progress.suite_end(Some("p1"), &summary);
        progress.suite_end(Some("p1"), &summary);
        progress.batch_end();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.batch, Counter { done: 1, total: 2 });
        assert_eq!(
            snapshot.totals,
            BatchTotals {
                passed: 1,
                failed: 1,
                skipped: 0,
                total: 2,
                duration_ms: 7,
                suites: 1
            }
        );
        assert!(snapshot.finished);

        progress.batch_start(1);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.totals, BatchTotals::default());
        assert!(!snapshot.finished);
    }

    #[test]
    fn huge_summaries_saturate_batch_totals() {
        let progress = ProgressAggregator::new();
        progress.batch_start(2);
        let summary = SuiteSummary {
            passed: u64::MAX,
            total: u64::MAX,
            duration_ms: u64::MAX,
            ..SuiteSummary::default()
        };
        progress.suite_end(Some("a"), &summary);
        progress.suite_end(Some("b"), &summary);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.totals.passed, u64::MAX);
        assert_eq!(snapshot.totals.total, u64::MAX);
        assert_eq!(snapshot.totals.duration_ms, u64::MAX);
        assert_eq!(snapshot.totals.suites, 2);
        assert_eq!(snapshot.batch, Counter { done: 2, total: 2 });
    }
}
