// Reconnect Supervisor
// Two independent stream lifecycles, combined into one connectivity flag,
// with a fixed-delay, capped reconnect policy

use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::types::{ConnectionStatus, StreamKind};

// ============================================================================
// Per-stream lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle of one stream. Every connect bumps the generation so events
/// from a superseded connection can be told apart.
#[derive(Debug, Clone)]
pub struct StreamLifecycle {
    pub kind: StreamKind,
    phase: StreamPhase,
    generation: u64,
}

impl StreamLifecycle {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            phase: StreamPhase::Idle,
            generation: 0,
        }
    }

    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.phase = StreamPhase::Connecting;
        self.generation
    }

    /// Returns false for a superseded generation
    pub fn on_open(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.phase != StreamPhase::Connecting {
            return false;
        }
        self.phase = StreamPhase::Open;
        true
    }

    /// Returns false for a superseded generation or an already-closed stream
    pub fn on_closed(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.is_live() {
            return false;
        }
        self.phase = StreamPhase::Closed;
        true
    }

    pub fn mark_closed(&mut self) {
        self.phase = StreamPhase::Closed;
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.phase == StreamPhase::Open
    }

    /// Connecting or open
    pub fn is_live(&self) -> bool {
        matches!(self.phase, StreamPhase::Connecting | StreamPhase::Open)
    }
}

/// Connectivity reducer: true only while both streams are open
pub fn connected(trade: &StreamLifecycle, depth: &StreamLifecycle) -> bool {
    trade.is_open() && depth.is_open()
}

// ============================================================================
// Supervisor
// ============================================================================

/// Side effects the supervisor asks the runtime to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    OpenStream { kind: StreamKind, generation: u64 },
    CloseStream { kind: StreamKind },
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
}

pub struct ReconnectSupervisor {
    trade: StreamLifecycle,
    depth: StreamLifecycle,
    reconnect_delay: Duration,
    max_attempts: u32,
    attempts: u32,
    reconnect_pending: bool,
    started: bool,
    active: bool,
    given_up: bool,
    stream_errors: u64,
}

impl ReconnectSupervisor {
    pub fn new(reconnect_delay: Duration, max_attempts: u32) -> Self {
        Self {
            trade: StreamLifecycle::new(StreamKind::Trade),
            depth: StreamLifecycle::new(StreamKind::Depth),
            reconnect_delay,
            max_attempts,
            attempts: 0,
            reconnect_pending: false,
            started: false,
            active: false,
            given_up: false,
            stream_errors: 0,
        }
    }

    /// Initial connect of both streams; not counted as a reconnect attempt
    pub fn start(&mut self) -> Vec<SupervisorAction> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        self.active = true;
        info!("Opening trade and depth streams");
        self.open_both()
    }

    /// Returns true when the open belongs to the current connection
    pub fn on_opened(&mut self, kind: StreamKind, generation: u64) -> bool {
        if !self.active {
            return false;
        }
        let accepted = self.stream_mut(kind).on_open(generation);
        if accepted {
            info!(stream = %kind, generation = generation, connected = self.is_connected(), "Stream open");
        }
        accepted
    }

    pub fn on_error(&mut self, kind: StreamKind, generation: u64) {
        if generation == self.stream(kind).generation() {
            self.stream_errors += 1;
            warn!(stream = %kind, generation = generation, "Stream error");
        }
    }

    /// A stream closed. Schedules a reconnect of both streams unless one is
    /// already pending, the engine stopped, or the attempt cap is spent.
    pub fn on_closed(&mut self, kind: StreamKind, generation: u64) -> Vec<SupervisorAction> {
        if !self.active || !self.stream_mut(kind).on_closed(generation) {
            return Vec::new();
        }

        warn!(stream = %kind, generation = generation, "Stream closed");

        if self.reconnect_pending || self.given_up {
            return Vec::new();
        }

        if self.attempts >= self.max_attempts {
            self.given_up = true;
            error!(
                attempts = self.attempts,
                max_attempts = self.max_attempts,
                "Reconnect attempts exhausted, giving up"
            );
            return Vec::new();
        }

        self.reconnect_pending = true;
        info!(
            delay_secs = self.reconnect_delay.as_secs(),
            attempt = self.attempts + 1,
            max_attempts = self.max_attempts,
            "Reconnect scheduled"
        );
        vec![SupervisorAction::ScheduleReconnect {
            delay: self.reconnect_delay,
        }]
    }

    /// Reconnect timer fired: close whatever is still up, then reopen both
    pub fn on_reconnect_due(&mut self) -> Vec<SupervisorAction> {
        if !self.active || !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;
        self.attempts += 1;

        info!(attempt = self.attempts, max_attempts = self.max_attempts, "Reconnecting both streams");

        let mut actions = Vec::new();
        for kind in [StreamKind::Trade, StreamKind::Depth] {
            let stream = self.stream_mut(kind);
            if stream.is_live() {
                stream.mark_closed();
                actions.push(SupervisorAction::CloseStream { kind });
            }
        }
        actions.extend(self.open_both());
        actions
    }

    /// Engine teardown: cancel the timer and close both streams
    pub fn shutdown(&mut self) -> Vec<SupervisorAction> {
        if !self.active {
            return Vec::new();
        }
        self.active = false;

        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(SupervisorAction::CancelReconnect);
        }
        for kind in [StreamKind::Trade, StreamKind::Depth] {
            let stream = self.stream_mut(kind);
            if stream.phase() != StreamPhase::Idle {
                stream.mark_closed();
                actions.push(SupervisorAction::CloseStream { kind });
            }
        }

        info!("Supervisor stopped");
        actions
    }

    fn open_both(&mut self) -> Vec<SupervisorAction> {
        [StreamKind::Trade, StreamKind::Depth]
            .into_iter()
            .map(|kind| SupervisorAction::OpenStream {
                kind,
                generation: self.stream_mut(kind).begin_connect(),
            })
            .collect()
    }

    pub fn stream(&self, kind: StreamKind) -> &StreamLifecycle {
        match kind {
            StreamKind::Trade => &self.trade,
            StreamKind::Depth => &self.depth,
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamLifecycle {
        match kind {
            StreamKind::Trade => &mut self.trade,
            StreamKind::Depth => &mut self.depth,
        }
    }

    /// Is `generation` the current connection of `kind`?
    pub fn is_current(&self, kind: StreamKind, generation: u64) -> bool {
        self.active && self.stream(kind).generation() == generation
    }

    pub fn is_connected(&self) -> bool {
        connected(&self.trade, &self.depth)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.started && !self.active {
            ConnectionStatus::Stopped
        } else if self.is_connected() {
            ConnectionStatus::Connected
        } else if self.given_up {
            ConnectionStatus::GivenUp
        } else if self.reconnect_pending || (self.attempts > 0 && self.any_connecting()) {
            ConnectionStatus::Reconnecting
        } else if self.any_connecting() {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn any_connecting(&self) -> bool {
        self.trade.phase() == StreamPhase::Connecting || self.depth.phase() == StreamPhase::Connecting
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_given_up(&self) -> bool {
        self.given_up
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn stream_errors(&self) -> u64 {
        self.stream_errors
    }
}
