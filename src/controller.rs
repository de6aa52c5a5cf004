//! Demand-driven polling loop.
//!
//! The controller owns the only telemetry session in the process. It acquires
//! the session when the first subscriber shows up, releases it as soon as
//! nobody is listening, and gives up after a bounded run of failed ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::data::DeviceSnapshot;
use crate::hub::{Broadcaster, SubscriberGate};
use crate::monitor::{TelemetryError, TelemetrySession, TelemetrySource};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_FAILURES_IN_A_ROW: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_failures_in_a_row: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_failures_in_a_row: DEFAULT_MAX_FAILURES_IN_A_ROW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// No session held, nobody subscribed.
    Idle,
    /// Polling and the last tick succeeded.
    Active,
    /// Polling but the most recent ticks failed.
    Degrading,
    /// Failure budget exhausted, polling stopped for good.
    Failed,
}

/// Read-only view of the controller, shared through a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollerStatus {
    pub state: PollState,
    pub consecutive_failures: u32,
    pub holding_source: bool,
    pub published: u64,
    pub last_published: Option<DateTime<Utc>>,
}

impl Default for PollerStatus {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            consecutive_failures: 0,
            holding_source: false,
            published: 0,
            last_published: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No demand; nothing was polled.
    Idle,
    Published,
    Failed { consecutive: u32 },
    /// Polling has stopped; further ticks do nothing.
    Terminal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollerError {
    #[error("polling stopped after {failures} consecutive failures: {last}")]
    TerminalFailure { failures: u32, last: TelemetryError },
}

pub struct PollingController<S, G, B>
where
    S: TelemetrySource,
{
    source: S,
    session: Option<S::Session>,
    gate: G,
    broadcaster: B,
    config: PollerConfig,
    consecutive_failures: u32,
    published: u64,
    last_published: Option<DateTime<Utc>>,
    terminal: Option<PollerError>,
    status: watch::Sender<PollerStatus>,
}

impl<S, G, B> PollingController<S, G, B>
where
    S: TelemetrySource,
    G: SubscriberGate,
    B: Broadcaster,
{
    pub fn new(source: S, gate: G, broadcaster: B, config: PollerConfig) -> Self {
        let (status, _) = watch::channel(PollerStatus::default());
        Self {
            source,
            session: None,
            gate,
            broadcaster,
            config,
            consecutive_failures: 0,
            published: 0,
            last_published: None,
            terminal: None,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<PollerStatus> {
        self.status.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_holding_source(&self) -> bool {
        self.session.is_some()
    }

    pub fn terminal_error(&self) -> Option<&PollerError> {
        self.terminal.as_ref()
    }

    /// Run one unit of work: demand check, lazy acquire, query, publish.
    pub fn tick(&mut self) -> TickOutcome {
        if self.terminal.is_some() {
            return TickOutcome::Terminal;
        }

        if !self.gate.has_subscribers() {
            self.release_session("no subscribers");
            self.report(PollState::Idle);
            return TickOutcome::Idle;
        }

        let polled = self
            .poll_once()
            .and_then(|snapshot| snapshot.to_payload().map(|payload| (snapshot, payload)));

        match polled {
            Ok((snapshot, payload)) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(
                        previous_failures = self.consecutive_failures,
                        "telemetry recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.published += 1;
                self.last_published = Some(snapshot.query_time);
                tracing::debug!(devices = snapshot.devices.len(), "publishing snapshot");
                self.broadcaster.publish(Arc::from(payload));
                self.report(PollState::Active);
                TickOutcome::Published
            }
            Err(err) => self.record_failure(err),
        }
    }

    fn poll_once(&mut self) -> Result<DeviceSnapshot, TelemetryError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                let session = self.source.acquire()?;
                tracing::info!("telemetry handle acquired");
                session
            }
        };
        let result = session.query_all();
        self.session = Some(session);
        result
    }

    fn record_failure(&mut self, err: TelemetryError) -> TickOutcome {
        self.consecutive_failures += 1;
        tracing::warn!(
            kind = %err.kind(),
            consecutive_failures = self.consecutive_failures,
            max_failures_in_a_row = self.config.max_failures_in_a_row,
            error = %err,
            "telemetry tick failed"
        );

        if !err.is_retryable() || self.consecutive_failures >= self.config.max_failures_in_a_row {
            return self.give_up(err);
        }

        self.report(PollState::Degrading);
        TickOutcome::Failed {
            consecutive: self.consecutive_failures,
        }
    }

    fn give_up(&mut self, last: TelemetryError) -> TickOutcome {
        tracing::error!(
            kind = %last.kind(),
            consecutive_failures = self.consecutive_failures,
            "giving up on GPU telemetry, polling stopped"
        );
        self.release_session("polling stopped");
        self.terminal = Some(PollerError::TerminalFailure {
            failures: self.consecutive_failures,
            last,
        });
        self.report(PollState::Failed);
        TickOutcome::Terminal
    }

    /// Release the held session, if any.
    pub fn release_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            session.release();
            tracing::info!(reason, "telemetry handle released");
        }
    }

    fn report(&self, state: PollState) {
        self.status.send_replace(PollerStatus {
            state,
            consecutive_failures: self.consecutive_failures,
            holding_source: self.session.is_some(),
            published: self.published,
            last_published: self.last_published,
        });
    }

    /// Tick on a fixed period until shutdown or terminal failure.
    ///
    /// Ticks never overlap: a slow tick delays the next one instead of
    /// letting ticks pile up.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PollerError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_failures_in_a_row = self.config.max_failures_in_a_row,
            "GPU poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release_session("shutdown");
                    self.report(PollState::Idle);
                    tracing::info!("GPU poller stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if self.tick() == TickOutcome::Terminal {
                if let Some(err) = self.terminal.clone() {
                    return Err(err);
                }
            }
        }
    }
}

impl<S, G, B> Drop for PollingController<S, G, B>
where
    S: TelemetrySource,
{
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
        }
    }
}
