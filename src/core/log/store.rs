//! Process-local holder for the most recent execution log.
//!
//! The store is the single piece of shared mutable state between the agent loop (writer) and the
//! renderers (readers). Readers only ever see owned [`LogSnapshot`] copies; listeners are plain
//! callbacks invoked synchronously, in registration order, after every write.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    FinalResultEvent, FinalResultTag, LogBatchResult, LogEvent, LogLevel, LogRole, LogStep,
    SchemaError, create_step_id, wire_precision,
};

pub type Listener = Arc<dyn Fn() + Send + Sync>;

type Registry = Mutex<BTreeMap<u64, Listener>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    pub steps: Vec<LogStep>,
    pub final_result: Option<FinalResultEvent>,
    pub system_prompt_excerpt: Option<String>,
}

pub struct ExecutionLogStore {
    state: Mutex<LogSnapshot>,
    listeners: Arc<Registry>,
    next_listener_id: AtomicU64,
    // Held for a whole replace-and-notify cycle so cycles never interleave.
    write_gate: Mutex<()>,
    // Thread running the current cycle; its writes from inside listeners wait in `pending`.
    cycle_owner: Mutex<Option<ThreadId>>,
    pending: Mutex<VecDeque<Write>>,
}

enum Write {
    Replace(LogSnapshot),
    Reset,
    Event(LogEvent),
}

/// Handle returned by [`ExecutionLogStore::subscribe`].
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Deregisters the listener. Calling it again, or after the store is gone, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for ExecutionLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLogStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogSnapshot::default()),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener_id: AtomicU64::new(1),
            write_gate: Mutex::new(()),
            cycle_owner: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn snapshot(&self) -> LogSnapshot {
        lock(&self.state).clone()
    }

    pub fn set_from_batch(&self, batch: &LogBatchResult) {
        self.write(Write::Replace(LogSnapshot {
            steps: batch.steps.clone(),
            final_result: batch.final_result.clone(),
            system_prompt_excerpt: batch.system_prompt_excerpt.clone(),
        }));
    }

    /// Accepts a payload from across a serialization boundary. A payload that fails the schema
    /// check is discarded and the current state is kept.
    pub fn ingest_value(&self, payload: Value) -> Result<(), SchemaError> {
        match LogBatchResult::from_value(payload) {
            Ok(batch) => {
                self.set_from_batch(&batch);
                Ok(())
            }
            Err(e) => {
                warn!("Discarding execution log payload: {}", e);
                Err(e)
            }
        }
    }

    pub fn reset(&self) {
        self.write(Write::Reset);
    }

    /// Streaming path: folds a single timeline event into the current state.
    pub fn apply_event(&self, event: LogEvent) {
        self.write(Write::Event(event));
    }

    /// Runs one replace-and-notify cycle. A write issued by a listener of the running cycle is
    /// queued and gets its own cycle once the current one has notified everyone.
    fn write(&self, op: Write) {
        let me = thread::current().id();
        if *lock(&self.cycle_owner) == Some(me) {
            debug!("Execution log write from a listener; deferred until the cycle ends");
            lock(&self.pending).push_back(op);
            return;
        }

        let _gate = lock(&self.write_gate);
        *lock(&self.cycle_owner) = Some(me);
        let mut next = Some(op);
        while let Some(op) = next {
            self.apply(op);
            self.notify();
            next = lock(&self.pending).pop_front();
        }
        *lock(&self.cycle_owner) = None;
    }

    fn apply(&self, op: Write) {
        let mut state = lock(&self.state);
        match op {
            Write::Replace(snapshot) => {
                debug!("Execution log replaced ({} steps)", snapshot.steps.len());
                *state = snapshot;
            }
            Write::Reset => *state = LogSnapshot::default(),
            Write::Event(LogEvent::Step { step }) => upsert_step(&mut state.steps, step),
            Write::Event(LogEvent::FinalResult {
                id,
                content,
                format,
                ts,
            }) => {
                state.final_result = Some(FinalResultEvent {
                    kind: FinalResultTag::FinalResult,
                    id,
                    content,
                    format,
                    timestamp: wire_precision(ts),
                });
            }
            Write::Event(LogEvent::SystemPromptExcerpt { text, .. }) => {
                state.system_prompt_excerpt = Some(text);
            }
            Write::Event(LogEvent::Error { message, stack, ts }) => {
                let index = state.steps.last().map_or(1, |s| s.index + 1);
                state.steps.push(LogStep {
                    id: create_step_id(index, LogRole::Other),
                    index,
                    role: LogRole::Other,
                    summary: format!("step#{} • error: {}", index, message),
                    content: message.clone(),
                    tool_calls: None,
                    tool_call_id: None,
                    timestamp: wire_precision(ts),
                    level: Some(LogLevel::Error),
                    error: Some(message),
                    raw: stack,
                });
            }
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(id, Arc::new(listener));
        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn notify(&self) {
        // Iterate over a copy so listeners may (un)subscribe while being notified.
        let listeners: Vec<(u64, Listener)> = lock(&self.listeners)
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                warn!("Execution log listener #{} panicked; continuing", id);
            }
        }
    }
}

fn upsert_step(steps: &mut Vec<LogStep>, step: LogStep) {
    match steps.binary_search_by_key(&step.index, |s| s.index) {
        Ok(pos) => steps[pos] = step,
        Err(pos) => steps.insert(pos, step),
    }
}
