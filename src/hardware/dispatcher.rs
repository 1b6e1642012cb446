//! Command dispatcher.
//!
//! Sends one textual command to a device channel and then holds the caller
//! for the command's settle delay. The fixture has no completion signalling,
//! so the delay is the acknowledgment.
//!
//! Positioning commands on the motion channel are followed by a status
//! query (GRBL `?`). If the controller reports anything other than idle or
//! running, typically an alarm raised mid-move, the unlock command is sent.

use std::sync::Arc;
use std::time::Duration;

use rbs_core::{ChannelRole, FixtureResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::channel::ChannelBank;

/// Motion controller command vocabulary and status handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProtocol {
    /// Status query command.
    pub status_query: String,
    /// Unlock command issued when the controller is alarmed.
    pub unlock: String,
    /// Soft reset command.
    pub soft_reset: String,
    /// How long to collect the status reply, in milliseconds.
    pub status_window_ms: u64,
}

impl Default for MotionProtocol {
    fn default() -> Self {
        Self {
            status_query: "?".to_string(),
            unlock: "$X".to_string(),
            soft_reset: "\u{18}".to_string(),
            status_window_ms: 200,
        }
    }
}

/// Controller state parsed from a `<State|...>` status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionStatus {
    /// Idle and ready.
    Idle,
    /// Executing a motion.
    Run,
    /// Alarm lock; needs unlock before accepting motion.
    Alarm,
    /// Some other reported state (`Hold`, `Door`, ...).
    Other(String),
    /// No status report was received.
    NoReply,
}

impl MotionStatus {
    /// Parse the last complete `<State|...>` report found in `reply`.
    ///
    /// Earlier reports are late answers to previous queries.
    pub fn parse(reply: &str) -> Self {
        let start = reply
            .rmatch_indices('<')
            .map(|(i, _)| i)
            .find(|&i| reply[i..].contains('>'))
            .or_else(|| reply.rfind('<'));
        let Some(start) = start else {
            return MotionStatus::NoReply;
        };
        let body = &reply[start + 1..];
        let end = body.find(['|', '>', ',']).unwrap_or(body.len());
        let state = body[..end].trim();
        let head = state.split(':').next().unwrap_or(state);

        match head.to_ascii_lowercase().as_str() {
            "idle" => MotionStatus::Idle,
            "run" | "jog" | "home" => MotionStatus::Run,
            "alarm" => MotionStatus::Alarm,
            _ => MotionStatus::Other(state.to_string()),
        }
    }

    /// Whether the controller can accept the next command without unlock.
    pub fn is_ready(&self) -> bool {
        matches!(self, MotionStatus::Idle | MotionStatus::Run)
    }
}

/// Whether `command` moves the stage (and therefore needs a readiness check).
pub fn is_positioning_command(command: &str) -> bool {
    let upper = command.trim().to_ascii_uppercase();
    if upper.starts_with("$H") || upper.starts_with("$J") || upper.starts_with("G28") {
        return true;
    }
    upper.starts_with('G')
        && upper
            .split_whitespace()
            .skip(1)
            .any(|word| word.starts_with(['X', 'Y', 'Z']))
}

/// Sends commands to device channels with open-loop settle delays.
pub struct CommandDispatcher {
    channels: Arc<ChannelBank>,
    motion: MotionProtocol,
    write_timeout: Duration,
}

impl CommandDispatcher {
    /// Create a dispatcher over `channels`.
    pub fn new(channels: Arc<ChannelBank>, motion: MotionProtocol, write_timeout: Duration) -> Self {
        Self {
            channels,
            motion,
            write_timeout,
        }
    }

    /// Channels this dispatcher writes to.
    pub fn channels(&self) -> &Arc<ChannelBank> {
        &self.channels
    }

    /// Motion vocabulary in use.
    pub fn motion_protocol(&self) -> &MotionProtocol {
        &self.motion
    }

    /// Send `command` to `role`, then wait `settle`.
    ///
    /// # Errors
    ///
    /// `ChannelUnavailable` if the channel is closed, `CommandTimeout` if the
    /// write stalls, `Io` if the link fails.
    #[instrument(skip(self), fields(role = %role), err)]
    pub async fn send(&self, role: ChannelRole, command: &str, settle: Duration) -> FixtureResult<()> {
        self.channels
            .get(role)
            .write_line(command, self.write_timeout)
            .await?;
        debug!(settle_ms = settle.as_millis() as u64, "command sent");

        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        if role == ChannelRole::Motion && is_positioning_command(command) {
            self.verify_motion_ready().await?;
        }
        Ok(())
    }

    /// Write `command` without settle delay or readiness check.
    pub async fn send_raw(&self, role: ChannelRole, command: &str) -> FixtureResult<()> {
        self.channels
            .get(role)
            .write_line(command, self.write_timeout)
            .await
    }

    /// Query the motion controller and unlock it if it is not idle/running.
    pub async fn verify_motion_ready(&self) -> FixtureResult<MotionStatus> {
        let channel = self.channels.get(ChannelRole::Motion);
        channel
            .write_line(&self.motion.status_query, self.write_timeout)
            .await?;
        let reply = channel
            .read_available(Duration::from_millis(self.motion.status_window_ms))
            .await?;

        let status = MotionStatus::parse(&reply);
        if !status.is_ready() {
            warn!(?status, reply = reply.trim(), "motion controller not ready, unlocking");
            channel.write_line(&self.motion.unlock, self.write_timeout).await?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parses_grbl_status_reports() {
        assert_eq!(MotionStatus::parse("<Idle|MPos:0.000,0.000,0.000|FS:0,0>\r\nok"), MotionStatus::Idle);
        assert_eq!(MotionStatus::parse("ok\n<Run|MPos:1.0,2.0,0.0>"), MotionStatus::Run);
        assert_eq!(MotionStatus::parse("<Alarm|MPos:0,0,0>"), MotionStatus::Alarm);
        assert_eq!(MotionStatus::parse("<Hold:0|MPos:0,0,0>"), MotionStatus::Other("Hold:0".into()));
        assert_eq!(MotionStatus::parse(""), MotionStatus::NoReply);
        assert_eq!(
            MotionStatus::parse("<Idle|MPos:0,0,0>\r\n<Alarm|MPos:0,0,0>\r\n"),
            MotionStatus::Alarm
        );
        assert_eq!(MotionStatus::parse("<Alarm|MPos:0,0,0>\r\n<Idl"), MotionStatus::Alarm);
        assert!(!MotionStatus::NoReply.is_ready());
    }

    #[test]
    fn recognises_positioning_commands() {
        assert!(is_positioning_command("G90 X29.787 Y82.987"));
        assert!(is_positioning_command("G28"));
        assert!(is_positioning_command("g1 x10"));
        assert!(is_positioning_command("$H"));
        assert!(!is_positioning_command("G90"));
        assert!(!is_positioning_command("G21"));
        assert!(!is_positioning_command("$X"));
        assert!(!is_positioning_command("K2_1"));
    }

    #[tokio::test]
    async fn stale_idle_report_does_not_hide_an_alarm() {
        let channels = Arc::new(ChannelBank::new());
        let (mut host, device) = tokio::io::duplex(256);
        channels
            .get(ChannelRole::Motion)
            .attach(Box::new(device), "motion")
            .await;
        host.write_all(b"<Idle|MPos:0,0,0>\r\n<Alarm|MPos:0,0,0>\r\n")
            .await
            .unwrap();

        let dispatcher = CommandDispatcher::new(channels, MotionProtocol::default(), Duration::from_millis(50));
        let status = dispatcher.verify_motion_ready().await.unwrap();
        assert_eq!(status, MotionStatus::Alarm);

        let mut sent = [0u8; 5];
        host.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"?\n$X\n");
    }
}
