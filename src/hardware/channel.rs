//! Device channels.
//!
//! A [`DeviceChannel`] owns at most one open serial handle for one
//! [`ChannelRole`]. Every read and write happens under the channel's own
//! lock, so a trigger poll on the relay channel never blocks motion
//! commands and two writers never interleave bytes on the same wire.
//!
//! Inbound data is line-oriented. Partial lines survive across polls in a
//! per-channel buffer, which keeps [`DeviceChannel::poll_line`] safe to call
//! under a short timeout.

use std::sync::Arc;
use std::time::Duration;

use rbs_core::serial::{drain_serial_buffer, open_serial_async};
use rbs_core::{ChannelRole, DynSerial, FixtureError, FixtureResult};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Quiet period that ends a [`DeviceChannel::read_available`] burst.
const READ_GRACE: Duration = Duration::from_millis(20);

/// Snapshot of one channel for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    /// Channel role.
    pub role: ChannelRole,
    /// Whether a handle is currently open.
    pub open: bool,
    /// Device path or label of the open handle.
    pub device: Option<String>,
    /// Baud rate of the open handle (0 for in-process links).
    pub baud: u32,
}

struct ChannelInner {
    port: Option<BufReader<DynSerial>>,
    device: Option<String>,
    baud: u32,
    pending: Vec<u8>,
}

impl ChannelInner {
    fn close(&mut self) -> bool {
        self.pending.clear();
        self.device = None;
        self.baud = 0;
        self.port.take().is_some()
    }
}

/// Lock-guarded byte stream to one physical controller.
pub struct DeviceChannel {
    role: ChannelRole,
    inner: Mutex<ChannelInner>,
}

impl DeviceChannel {
    /// Create a closed channel for `role`.
    pub fn new(role: ChannelRole) -> Self {
        Self {
            role,
            inner: Mutex::new(ChannelInner {
                port: None,
                device: None,
                baud: 0,
                pending: Vec::new(),
            }),
        }
    }

    /// Role of this channel.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Open the serial device, closing any handle already held.
    pub async fn connect(&self, device: &str, baud: u32) -> FixtureResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.close() {
            info!(role = %self.role, "closed previous handle before reconnecting");
        }

        let stream = open_serial_async(device, baud, self.role)
            .await
            .map_err(|e| FixtureError::Io(std::io::Error::other(format!("{e:#}"))))?;

        inner.port = Some(BufReader::new(Box::new(stream)));
        inner.device = Some(device.to_string());
        inner.baud = baud;
        info!(role = %self.role, device, baud, "channel connected");
        Ok(())
    }

    /// Install an already-open stream (simulated controllers, tests).
    pub async fn attach(&self, port: DynSerial, label: &str) {
        let mut inner = self.inner.lock().await;
        inner.close();
        inner.port = Some(BufReader::new(port));
        inner.device = Some(label.to_string());
        info!(role = %self.role, device = label, "channel attached");
    }

    /// Close the handle. Closing a closed channel is a no-op.
    pub async fn disconnect(&self) {
        if self.inner.lock().await.close() {
            info!(role = %self.role, "channel disconnected");
        }
    }

    /// Whether a handle is open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.port.is_some()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> ChannelStatus {
        let inner = self.inner.lock().await;
        ChannelStatus {
            role: self.role,
            open: inner.port.is_some(),
            device: inner.device.clone(),
            baud: inner.baud,
        }
    }

    /// Write `command` followed by a newline.
    ///
    /// An I/O failure drops the handle: a controller that stopped accepting
    /// bytes is treated as physically disconnected until reconnected.
    pub async fn write_line(&self, command: &str, deadline: Duration) -> FixtureResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(port) = inner.port.as_mut() else {
            return Err(FixtureError::ChannelUnavailable { role: self.role });
        };

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');

        let written = tokio::time::timeout(deadline, async {
            port.get_mut().write_all(line.as_bytes()).await?;
            port.get_mut().flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(role = %self.role, error = %e, "write failed, dropping handle");
                inner.close();
                Err(FixtureError::Io(e))
            }
            Err(_) => Err(FixtureError::CommandTimeout {
                role: self.role,
                command: command.to_string(),
            }),
        }
    }

    /// Collect whatever arrives within `window`, returning once the line has
    /// been quiet for a short grace period after the first bytes.
    pub async fn read_available(&self, window: Duration) -> FixtureResult<String> {
        let mut inner = self.inner.lock().await;
        let ChannelInner { port, pending, .. } = &mut *inner;
        let Some(reader) = port.as_mut() else {
            return Err(FixtureError::ChannelUnavailable { role: self.role });
        };

        let mut collected = std::mem::take(pending);
        let mut chunk = [0u8; 256];
        let mut wait = window;
        loop {
            let read = tokio::time::timeout(wait, reader.read(&mut chunk)).await;
            match read {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    collected.extend_from_slice(&chunk[..n]);
                    wait = READ_GRACE;
                }
                Ok(Err(e)) => {
                    debug!(role = %self.role, error = %e, "read failed");
                    break;
                }
            }
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Return the next complete inbound line, waiting at most `wait` for
    /// more bytes. Blank lines are skipped.
    ///
    /// End of stream drops the handle and is reported as an error.
    pub async fn poll_line(&self, wait: Duration) -> FixtureResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        let ChannelInner {
            port,
            device,
            baud,
            pending,
        } = &mut *inner;

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(line) = take_line(pending) {
                return Ok(Some(line));
            }
            let Some(reader) = port.as_mut() else {
                return Err(FixtureError::ChannelUnavailable { role: self.role });
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let read = tokio::time::timeout(remaining, reader.read_until(b'\n', pending)).await;
            let failure = match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
            };

            warn!(role = %self.role, error = %failure, "inbound stream closed");
            *port = None;
            *device = None;
            *baud = 0;
            pending.clear();
            return Err(FixtureError::Io(failure));
        }
    }

    /// Discard buffered input (ours and the transport's) and flush output.
    pub async fn clear_buffers(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        if let Some(port) = inner.port.as_mut() {
            let buffered = port.buffer().len();
            port.consume(buffered);
            let discarded = drain_serial_buffer(port.get_mut(), READ_GRACE).await;
            if let Err(e) = port.get_mut().flush().await {
                debug!(role = %self.role, error = %e, "flush failed while clearing buffers");
            }
            if buffered + discarded > 0 {
                debug!(role = %self.role, bytes = buffered + discarded, "discarded stale input");
            }
        }
    }
}

fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

/// The fixed set of channels, one per role.
pub struct ChannelBank {
    motion: Arc<DeviceChannel>,
    relay: Arc<DeviceChannel>,
    infrared: Arc<DeviceChannel>,
}

impl ChannelBank {
    /// Create a bank with every channel closed.
    pub fn new() -> Self {
        Self {
            motion: Arc::new(DeviceChannel::new(ChannelRole::Motion)),
            relay: Arc::new(DeviceChannel::new(ChannelRole::Relay)),
            infrared: Arc::new(DeviceChannel::new(ChannelRole::Infrared)),
        }
    }

    /// Channel for `role`.
    pub fn get(&self, role: ChannelRole) -> &Arc<DeviceChannel> {
        match role {
            ChannelRole::Motion => &self.motion,
            ChannelRole::Relay => &self.relay,
            ChannelRole::Infrared => &self.infrared,
        }
    }

    /// Status of every channel.
    pub async fn status(&self) -> Vec<ChannelStatus> {
        let mut out = Vec::with_capacity(ChannelRole::ALL.len());
        for role in ChannelRole::ALL {
            out.push(self.get(role).status().await);
        }
        out
    }

    /// Close every channel.
    pub async fn close_all(&self) {
        for role in ChannelRole::ALL {
            self.get(role).disconnect().await;
        }
    }
}

impl Default for ChannelBank {
    fn default() -> Self {
        Self::new()
    }
}
