//! Mock hardware for simulation and tests.
//!
//! - [`MockController`]: scripted controller firmware on the far end of an
//!   in-process duplex link. Records every line it receives, answers GRBL
//!   status queries on the motion role and can push inbound lines (the
//!   relay board's pneumatic trigger) or hang up mid-run.
//! - [`SyntheticFrameSource`]: camera that returns a fixed frame, can be
//!   permanently offline or drop out after a number of reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rbs_core::{ChannelRole, DynSerial, FixtureError, FixtureResult, Frame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use super::camera::FrameSource;
use super::dispatcher::is_positioning_command;

const LINK_CAPACITY: usize = 4096;

/// Behaviour of a [`MockController`].
#[derive(Debug, Clone)]
pub struct MockControllerOptions {
    /// State word reported to status queries (`Idle`, `Alarm`, ...).
    pub status: String,
    /// Hang up when a positioning command arrives after this many.
    pub hang_up_after_moves: Option<usize>,
}

impl Default for MockControllerOptions {
    fn default() -> Self {
        Self {
            status: "Idle".to_string(),
            hang_up_after_moves: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<String>>,
    status: Mutex<String>,
    moves: AtomicUsize,
}

/// Handle to a running mock controller.
#[derive(Clone)]
pub struct MockController {
    role: ChannelRole,
    state: Arc<MockState>,
    inbound: mpsc::UnboundedSender<String>,
    hang_up: Arc<Notify>,
}

impl MockController {
    /// Spawn a controller for `role`; returns the host end of the link.
    pub fn spawn(role: ChannelRole, options: MockControllerOptions) -> (DynSerial, MockController) {
        let (host, device) = tokio::io::duplex(LINK_CAPACITY);
        let (inbound, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState::default());
        *state.status.lock() = options.status.clone();
        let hang_up = Arc::new(Notify::new());

        tokio::spawn(firmware_loop(
            role,
            device,
            Arc::clone(&state),
            outbound_rx,
            Arc::clone(&hang_up),
            options,
        ));

        (
            Box::new(host),
            MockController {
                role,
                state,
                inbound,
                hang_up,
            },
        )
    }

    /// Role this controller simulates.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Every line received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    /// Received lines excluding status queries.
    pub fn commands(&self) -> Vec<String> {
        self.received().into_iter().filter(|l| l != "?").collect()
    }

    /// Number of positioning commands received.
    pub fn moves(&self) -> usize {
        self.state.moves.load(Ordering::Acquire)
    }

    /// Change the state word reported to status queries.
    pub fn set_status(&self, status: &str) {
        *self.state.status.lock() = status.to_string();
    }

    /// Send `line` to the host as if the controller emitted it.
    pub fn inject(&self, line: &str) {
        let _ = self.inbound.send(line.to_string());
    }

    /// Drop the link.
    pub fn hang_up(&self) {
        self.hang_up.notify_one();
    }

    /// Wait until at least `count` positioning commands have arrived.
    pub async fn wait_for_moves(&self, count: usize) {
        while self.moves() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn firmware_loop(
    role: ChannelRole,
    device: tokio::io::DuplexStream,
    state: Arc<MockState>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    hang_up: Arc<Notify>,
    options: MockControllerOptions,
) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim_end_matches('\r').to_string();
                state.received.lock().push(line.clone());

                if role != ChannelRole::Motion {
                    continue;
                }
                let reply = if line == "?" {
                    format!("<{}|MPos:0.000,0.000,0.000|FS:0,0>\r\nok\r\n", state.status.lock())
                } else {
                    if is_positioning_command(&line) {
                        let seen = state.moves.fetch_add(1, Ordering::AcqRel) + 1;
                        if options.hang_up_after_moves.is_some_and(|limit| seen > limit) {
                            break;
                        }
                    }
                    "ok\r\n".to_string()
                };
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Some(out) = outbound.recv() => {
                if writer.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            () = hang_up.notified() => break,
        }
    }
}

/// Deterministic RGB test pattern; different seeds give clearly different
/// images.
pub fn synthetic_pattern(width: u32, height: u32, seed: u32) -> Frame {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    let cell = 4 + (seed % 5) * 3;
    for y in 0..height {
        for x in 0..width {
            let gradient = ((x * 255) / width.max(1)) as u8;
            let checker = if ((x / cell) + (y / cell) + seed) % 2 == 0 { 200u8 } else { 40u8 };
            let band = (((y + seed * 7) * 255) / height.max(1)) as u8;
            data.push(gradient.wrapping_add((seed * 37) as u8));
            data.push(checker);
            data.push(band);
        }
    }
    Frame::rgb(width, height, data)
}

/// Camera returning a fixed frame.
pub struct SyntheticFrameSource {
    frame: Option<Frame>,
    open: bool,
    reads: u64,
    fail_after: Option<u64>,
}

impl SyntheticFrameSource {
    /// Source that always returns `frame`.
    pub fn new(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            open: false,
            reads: 0,
            fail_after: None,
        }
    }

    /// Source whose device never opens.
    pub fn offline() -> Self {
        Self {
            frame: None,
            open: false,
            reads: 0,
            fail_after: None,
        }
    }

    /// After `reads` frames the device disappears for good.
    #[must_use]
    pub fn fail_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }

    fn lost(&self) -> bool {
        self.fail_after.is_some_and(|limit| self.reads >= limit)
    }
}

impl FrameSource for SyntheticFrameSource {
    fn open(&mut self) -> FixtureResult<()> {
        if self.frame.is_none() || self.lost() {
            return Err(FixtureError::Io(std::io::ErrorKind::NotFound.into()));
        }
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> FixtureResult<Frame> {
        if !self.open || self.lost() {
            return Err(FixtureError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        self.reads += 1;
        let mut frame = self
            .frame
            .clone()
            .ok_or_else(|| FixtureError::Io(std::io::ErrorKind::NotConnected.into()))?;
        frame.captured_at = chrono::Utc::now();
        Ok(frame)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        if self.frame.is_some() {
            "synthetic".to_string()
        } else {
            "synthetic:offline".to_string()
        }
    }
}
