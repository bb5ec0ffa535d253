//! Data structures for tracking channel state.
//!
//! A [`Channel`] is the live counterpart of a parsed [`Formula`]: its
//! lifecycle state, process ids and timestamps. The run controller owns one
//! per formula from launch to join.

use std::time::Instant;

use crate::formula::Formula;

/// The lifecycle state of a channel. Transitions are monotonic:
/// `Pending → Started → Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No process has been created yet.
    Pending,
    /// The child process spawned successfully.
    Started,
    /// The child process has been waited on.
    Ended,
}

/// Runtime state of a single channel.
#[derive(Debug)]
pub struct Channel {
    /// The parsed description this channel runs.
    pub formula: Formula,
    /// Current lifecycle state.
    pub state: ChannelState,
    /// Process id once spawned.
    pub pid: Option<u32>,
    /// Process group id; equals `pid`, each child leads its own group.
    pub pgid: Option<i32>,
    /// When the spawn succeeded.
    pub started_at: Option<Instant>,
    /// When the exit was observed.
    pub ended_at: Option<Instant>,
    /// Encoded exit code (`128 + signo` for signal deaths, `-1` for spawn
    /// failures).
    pub exit_code: Option<i32>,
    /// Whether this channel needs no further events. Covers spawn failures
    /// and skipped channels, which never leave `Pending`.
    pub done: bool,
}

impl Channel {
    pub fn new(formula: Formula) -> Self {
        Self {
            formula,
            state: ChannelState::Pending,
            pid: None,
            pgid: None,
            started_at: None,
            ended_at: None,
            exit_code: None,
            done: false,
        }
    }

    pub fn mark_started(&mut self, pid: u32) {
        self.state = ChannelState::Started;
        self.pid = Some(pid);
        self.pgid = Some(pid as i32);
        self.started_at = Some(Instant::now());
    }

    pub fn mark_ended(&mut self, code: i32) {
        self.state = ChannelState::Ended;
        self.exit_code = Some(code);
        self.ended_at = Some(Instant::now());
        self.done = true;
    }

    pub fn mark_spawn_failed(&mut self) {
        self.exit_code = Some(-1);
        self.done = true;
    }

    pub fn mark_skipped(&mut self) {
        self.done = true;
    }
}
