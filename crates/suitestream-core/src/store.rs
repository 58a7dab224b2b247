//! Authoritative per-run suite state with sticky-failure badges.
//!
//! Every mutation is keyed by suite path (and test name), so the store gives
//! the same result regardless of the order in which concurrent handlers
//! complete. Subscribers are notified outside the lock; a panicking subscriber
//! does not prevent the others from being notified.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{Status, SuiteSummary, TestRecord, normalize_status};

/// State of one suite for the current run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteState {
    pub path: String,
    pub display_name: Option<String>,
    pub badge: Status,
    pub summary: Option<SuiteSummary>,
    pub tests: BTreeMap<String, TestRecord>,
}

impl SuiteState {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            display_name: None,
            badge: Status::Unknown,
            summary: None,
            tests: BTreeMap::new(),
        }
    }
}

/// Incoming result for one test; omitted fields keep their previous values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestUpdate {
    pub status: String,
    pub duration_ms: Option<u64>,
    pub messages: Option<Vec<String>>,
}

/// Change notification delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreChange {
    Test {
        path: String,
        name: String,
        data: TestRecord,
    },
    Summary {
        path: String,
        data: SuiteSummary,
    },
    Badge {
        path: String,
        data: Status,
    },
    Reset {
        path: String,
    },
    /// User-visible error line.
    Error {
        path: Option<String>,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    suites: BTreeMap<String, SuiteState>,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
}

/// Cloneable handle to one run's suite state.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the record for (`path`, `name`) and recomputes the suite badge.
    ///
    /// Returns `None` when either key is empty.
    pub fn set_test(&self, path: &str, name: &str, update: TestUpdate) -> Option<TestRecord> {
        if path.is_empty() || name.is_empty() {
            return None;
        }
        let record = {
            let mut inner = self.lock();
            let suite = suite_entry(&mut inner.suites, path);
            apply_test_update(suite, name, update, Utc::now())
        };
        self.notify(StoreChange::Test {
            path: path.to_string(),
            name: name.to_string(),
            data: record.clone(),
        });
        Some(record)
    }

    /// Stores a `suiteEnd` summary and derives the badge from its counts.
    pub fn set_summary(&self, path: &str, summary: SuiteSummary) {
        if path.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            let suite = suite_entry(&mut inner.suites, path);
            suite.summary = Some(summary);
            suite.badge = sticky_badge(suite.badge, summary.badge());
        }
        self.notify(StoreChange::Summary {
            path: path.to_string(),
            data: summary,
        });
    }

    /// Overrides the badge unless the suite has already failed. Returns the stored badge.
    pub fn set_badge(&self, path: &str, status: Status) -> Option<Status> {
        if path.is_empty() {
            return None;
        }
        let badge = {
            let mut inner = self.lock();
            let suite = suite_entry(&mut inner.suites, path);
            suite.badge = sticky_badge(suite.badge, status);
            suite.badge
        };
        if badge != status {
            debug!(path, requested = %status, "badge override rejected; suite already failed");
        }
        self.notify(StoreChange::Badge {
            path: path.to_string(),
            data: badge,
        });
        Some(badge)
    }

    /// Starts a new run of the suite: tests, summary and badge go back to their initial state.
    pub fn reset_suite(&self, path: &str, display_name: Option<&str>) {
        if path.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            let mut fresh = SuiteState::new(path);
            fresh.display_name = display_name.filter(|n| !n.is_empty()).map(str::to_string);
            inner.suites.insert(path.to_string(), fresh);
        }
        self.notify(StoreChange::Reset {
            path: path.to_string(),
        });
    }

    /// Surfaces a user-visible error to subscribers without touching suite state.
    pub fn report_error(&self, path: Option<&str>, message: &str) {
        self.notify(StoreChange::Error {
            path: path.map(str::to_string),
            message: message.to_string(),
        });
    }

    /// Deep copy of one suite.
    pub fn get_suite(&self, path: &str) -> Option<SuiteState> {
        self.lock().suites.get(path).cloned()
    }

    /// Deep copy of every known suite.
    pub fn get_all(&self) -> BTreeMap<String, SuiteState> {
        self.lock().suites.clone()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.lock();
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner.subscribers.insert(id, Arc::new(callback));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    fn notify(&self, change: StoreChange) {
        let subscribers: Vec<Subscriber> = self.lock().subscribers.values().cloned().collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&change))).is_err() {
                warn!(change = ?change, "store subscriber panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn suite_entry<'a>(suites: &'a mut BTreeMap<String, SuiteState>, path: &str) -> &'a mut SuiteState {
    suites
        .entry(path.to_string())
        .or_insert_with(|| SuiteState::new(path))
}

/// Once a suite has failed in the current run it stays failed.
pub fn sticky_badge(current: Status, candidate: Status) -> Status {
    if current == Status::Failed {
        Status::Failed
    } else {
        candidate
    }
}

/// Applies one test result to a suite: normalize, upsert, recompute badge.
pub fn apply_test_update(
    suite: &mut SuiteState,
    name: &str,
    update: TestUpdate,
    now: DateTime<Utc>,
) -> TestRecord {
    let previous = suite.tests.get(name);
    let messages = update
        .messages
        .or_else(|| previous.map(|p| p.messages.clone()))
        .unwrap_or_default();
    let duration_ms = update
        .duration_ms
        .or_else(|| previous.map(|p| p.duration_ms))
        .unwrap_or_default();
    let record = TestRecord {
        name: name.to_string(),
        status: normalize_status(&update.status, &messages),
        duration_ms,
        messages,
        last_updated_at: now,
    };
    suite.tests.insert(name.to_string(), record.clone());

    let candidate = Status::badge_of(suite.tests.values().map(|t| t.status));
    suite.badge = sticky_badge(suite.badge, candidate);
    record
}
