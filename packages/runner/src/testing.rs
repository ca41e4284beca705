//! Test utilities: configurable mock task, map-backed config source, and a
//! manually advanced clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::config::ConfigSource;
use crate::invocation::Invocation;
use crate::task::{Task, TaskContext, Validation};

/// Shared log of completed executions, for asserting completion order.
#[derive(Clone, Default)]
pub struct CompletionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, label: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(label.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A mock task with configurable delay, failure schedule, and validation.
///
/// Records execution timestamps and concurrency so tests can assert backoff
/// spacing and capacity limits.
pub struct MockTask {
    delay: Duration,
    items: u64,
    /// Executions left that should fail with a retryable-looking error.
    fail_remaining: AtomicU32,
    terminal_errors: bool,
    panic_on_execute: AtomicBool,
    validate_ready: AtomicBool,
    completion_log: Option<CompletionLog>,
    label: Option<String>,
    executions: Mutex<Vec<DateTime<Utc>>>,
    concurrent: AtomicU32,
    max_concurrent_seen: AtomicU32,
    items_seen: AtomicU64,
}

impl MockTask {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            items: 1,
            fail_remaining: AtomicU32::new(0),
            terminal_errors: false,
            panic_on_execute: AtomicBool::new(false),
            validate_ready: AtomicBool::new(true),
            completion_log: None,
            label: None,
            executions: Mutex::new(Vec::new()),
            concurrent: AtomicU32::new(0),
            max_concurrent_seen: AtomicU32::new(0),
            items_seen: AtomicU64::new(0),
        }
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Items-processed value returned by successful executions.
    pub fn with_items(mut self, items: u64) -> Self {
        self.items = items;
        self
    }

    /// Fail the first `n` executions.
    pub fn fail_first(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Make failures look permanent to the default classifier.
    pub fn with_terminal_errors(mut self) -> Self {
        self.terminal_errors = true;
        self
    }

    pub fn panic_on_execute(self) -> Self {
        self.panic_on_execute.store(true, Ordering::SeqCst);
        self
    }

    /// Label completed executions into a shared log.
    pub fn with_completion_log(mut self, log: CompletionLog, label: impl Into<String>) -> Self {
        self.completion_log = Some(log);
        self.label = Some(label.into());
        self
    }

    pub fn set_validate_ready(&self, ready: bool) {
        self.validate_ready.store(ready, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.executions_lock().len()
    }

    /// Start timestamps of every execution, in order.
    pub fn execution_times(&self) -> Vec<DateTime<Utc>> {
        self.executions_lock().clone()
    }

    /// Highest number of simultaneous executions observed.
    pub fn max_concurrent_seen(&self) -> u32 {
        self.max_concurrent_seen.load(Ordering::SeqCst)
    }

    pub fn total_items(&self) -> u64 {
        self.items_seen.load(Ordering::SeqCst)
    }

    fn executions_lock(&self) -> MutexGuard<'_, Vec<DateTime<Utc>>> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for MockTask {
    async fn validate(&self, _invocation: &Invocation) -> Result<Validation> {
        if self.validate_ready.load(Ordering::SeqCst) {
            Ok(Validation::Ready)
        } else {
            Ok(Validation::Skip("nothing to do".to_string()))
        }
    }

    async fn execute(&self, invocation: &Invocation, _ctx: &TaskContext) -> Result<u64> {
        self.executions_lock().push(Utc::now());

        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_seen.fetch_max(current, Ordering::SeqCst);

        if self.panic_on_execute.load(Ordering::SeqCst) {
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            panic!("mock task panic");
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            if self.terminal_errors {
                bail!("payload is invalid");
            }
            bail!("transient upstream failure");
        }

        if let Some(log) = &self.completion_log {
            // A "tag" payload field labels individual invocations; the static
            // label covers scheduled ones.
            let tag = invocation
                .payload
                .as_ref()
                .and_then(|payload| payload.get("tag"))
                .and_then(|tag| tag.as_str())
                .map(str::to_string)
                .or_else(|| self.label.clone());
            if let Some(tag) = tag {
                log.record(&tag);
            }
        }

        self.items_seen.fetch_add(self.items, Ordering::SeqCst);
        Ok(self.items)
    }
}

/// Map-backed configuration source.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    values: HashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// A clock that only moves when the test advances it.
///
/// `sleep` waits until `advance` has pushed the clock past the wake-up time;
/// tests that only need `now` control can ignore it.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    notify: Notify,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
            notify: Notify::new(),
        }
    }

    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
            *now = *now + duration;
        }
        self.notify.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        let until = self.now() + duration;
        loop {
            let notified = self.notify.notified();
            if self.now() >= until {
                return;
            }
            notified.await;
        }
    }
}
