//! Lifecycle events and the latched signal bus.
//!
//! Channel tasks report [`Event`]s to the run controller over an mpsc
//! channel. Independently, the [`Bus`] carries per-channel `started` /
//! `ended` signals between supervisors and the schedulers waiting on them.
//! Bus signals are latched: a waiter that subscribes after the fire is
//! satisfied immediately, so dependencies see a level, not an edge.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

/// A lifecycle event reported by a channel task.
#[derive(Debug, Clone)]
pub enum Event {
    /// The child process spawned successfully.
    Started { name: String, pid: u32 },
    /// The child process exited with the encoded code.
    Ended { name: String, code: i32 },
    /// The spawn itself failed; the channel never reached Started.
    SpawnFailed { name: String },
    /// Shutdown arrived before the start condition was met; no process was
    /// created.
    Skipped { name: String },
}

struct Signals {
    started: watch::Sender<bool>,
    ended: watch::Sender<Option<i32>>,
}

/// Process-wide registry of latched start/end signals, keyed by channel
/// name. Built once after validation, when all names are known.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<HashMap<String, Signals>>,
}

impl Bus {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let inner = names
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    Signals {
                        started: watch::Sender::new(false),
                        ended: watch::Sender::new(None),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Latches the `started` signal. Idempotent.
    pub fn fire_started(&self, name: &str) {
        if let Some(signals) = self.inner.get(name) {
            signals.started.send_replace(true);
        }
    }

    /// Latches the `ended` signal with the exit code. The first call wins.
    pub fn fire_ended(&self, name: &str, code: i32) {
        if let Some(signals) = self.inner.get(name) {
            signals.ended.send_modify(|value| {
                if value.is_none() {
                    *value = Some(code);
                }
            });
        }
    }

    /// Waits until `name` has started. Returns immediately if it already
    /// has, or if the name is unknown.
    pub async fn started(&self, name: &str) {
        if let Some(signals) = self.inner.get(name) {
            let mut rx = signals.started.subscribe();
            let _ = rx.wait_for(|fired| *fired).await;
        }
    }

    /// Waits until `name` has ended, yielding its exit code.
    pub async fn ended(&self, name: &str) -> Option<i32> {
        let signals = self.inner.get(name)?;
        let mut rx = signals.ended.subscribe();
        let result = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        result
    }
}
