//! Physical trigger listener.
//!
//! The relay controller reports the pneumatic start button as a text line.
//! A background task polls the relay channel for the whole life of the
//! process:
//!
//! - `start` (any case) starts a run on the configured side; `start1` and
//!   `start2` pick the side explicitly
//! - `emerg` drives the fixture to its safe state
//! - anything else is logged and dropped
//!
//! Input is flushed after every line so stale bytes never reach the next
//! read. The relay lock is only held for a short read window, never for
//! the whole poll interval, so run commands on the same channel are not
//! delayed.

use std::sync::Arc;
use std::time::Duration;

use rbs_core::{FixtureError, FixtureResult};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hardware::channel::DeviceChannel;
use crate::sequencer::engine::millis;
use crate::sequencer::{EmergencyController, FixtureSide, Sequencer};

/// Emergency token sent by the relay controller.
pub const EMERGENCY_TOKEN: &str = "emerg";

/// Listener timing and token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Run the listener at all.
    pub enabled: bool,
    /// Start token, compared case-insensitively.
    pub token: String,
    /// Delay between polls.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// How long a poll may wait for bytes while holding the channel.
    #[serde(with = "millis")]
    pub read_window: Duration,
    /// Delay after a failed read.
    #[serde(with = "millis")]
    pub error_backoff: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            token: "start".to_string(),
            poll_interval: Duration::from_millis(100),
            read_window: Duration::from_millis(10),
            error_backoff: Duration::from_millis(1000),
        }
    }
}

/// A line received from the relay controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// Start a run; `None` uses the configured side.
    Start(Option<FixtureSide>),
    /// Emergency stop.
    Emergency,
    /// Anything else.
    Ignored(String),
}

impl TriggerEvent {
    /// Classify `line` against the start `token`.
    pub fn classify(line: &str, token: &str) -> Self {
        let word = line.trim();
        if word.eq_ignore_ascii_case(token) {
            return TriggerEvent::Start(None);
        }
        if word.eq_ignore_ascii_case(EMERGENCY_TOKEN) {
            return TriggerEvent::Emergency;
        }
        if word.len() == token.len() + 1 && word.is_char_boundary(token.len()) {
            let (head, tail) = word.split_at(token.len());
            if head.eq_ignore_ascii_case(token) {
                if let Some(side) = tail.parse::<u8>().ok().and_then(|n| FixtureSide::try_from(n).ok()) {
                    return TriggerEvent::Start(Some(side));
                }
            }
        }
        TriggerEvent::Ignored(word.to_string())
    }
}

/// Polls the relay channel and starts runs.
pub struct TriggerListener {
    channel: Arc<DeviceChannel>,
    sequencer: Arc<Sequencer>,
    emergency: Arc<EmergencyController>,
    settings: TriggerSettings,
}

/// Running listener task.
pub struct TriggerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Stop the listener and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "trigger listener ended abnormally");
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl TriggerListener {
    /// Listener on `channel` (normally the relay channel).
    pub fn new(
        channel: Arc<DeviceChannel>,
        sequencer: Arc<Sequencer>,
        emergency: Arc<EmergencyController>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            channel,
            sequencer,
            emergency,
            settings,
        }
    }

    /// Run on the current runtime until the handle is stopped.
    pub fn spawn(self) -> TriggerHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        TriggerHandle {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Poll until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(role = %self.channel.role(), token = %self.settings.token, "trigger listener started");
        loop {
            let pause = match self.poll_once().await {
                Ok(_) => self.settings.poll_interval,
                Err(FixtureError::ChannelUnavailable { .. }) => self.settings.error_backoff,
                Err(e) => {
                    warn!(error = %e, "trigger read failed, backing off");
                    self.settings.error_backoff
                }
            };
            tokio::select! {
                _ = &mut shutdown => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        info!("trigger listener stopped");
    }

    /// Read at most one line and act on it.
    pub async fn poll_once(&self) -> FixtureResult<Option<TriggerEvent>> {
        let Some(line) = self.channel.poll_line(self.settings.read_window).await? else {
            return Ok(None);
        };
        let event = TriggerEvent::classify(&line, &self.settings.token);
        self.channel.clear_buffers().await;

        match &event {
            TriggerEvent::Start(side) => self.start(*side),
            TriggerEvent::Emergency => {
                self.emergency.trigger("emergency token from relay controller").await;
            }
            TriggerEvent::Ignored(text) => debug!(line = %text, "unrecognised trigger line dropped"),
        }
        Ok(Some(event))
    }

    fn start(&self, side: Option<FixtureSide>) {
        if self.sequencer.is_running() {
            info!("start token received while a run is active, ignored");
            return;
        }
        let started = match side {
            Some(side) => self.sequencer.start_run_on(side),
            None => self.sequencer.start_run(),
        };
        match started {
            Ok(handle) => {
                info!(run = handle.run_index(), "run started by physical trigger");
                tokio::spawn(async move {
                    let run = handle.run_index();
                    match handle.wait().await {
                        Ok(report) => info!(run, summary = %report.summary.text, "triggered run finished"),
                        Err(e) => warn!(run, error = %e, "triggered run failed"),
                    }
                });
            }
            Err(e) => warn!(error = %e, "physical trigger rejected"),
        }
    }
}
