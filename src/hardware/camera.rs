//! Camera acquisition.
//!
//! Each [`CameraManager`] runs one dedicated OS thread that pulls frames from
//! a blocking [`FrameSource`] and overwrites a single-slot latest-frame
//! buffer. Readers copy the slot under a lock held only for the clone, so
//! slow hardware settle delays on the control plane never stall acquisition
//! and acquisition never stalls the control plane.
//!
//! A camera that fails to open at start stays `Disconnected` without
//! affecting the rest of the fixture. A camera that drops out while running
//! is reopened with a fixed backoff; after the configured number of attempts
//! it is reported `Degraded` but keeps retrying at the same cadence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rbs_core::{FixtureError, FixtureResult, Frame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Step used when sleeping on the acquisition thread, so `stop()` is
/// observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// A blocking frame producer driven from a camera thread.
pub trait FrameSource: Send + 'static {
    /// Acquire the device handle.
    fn open(&mut self) -> FixtureResult<()>;

    /// Block until the next frame is available.
    fn read_frame(&mut self) -> FixtureResult<Frame>;

    /// Release the device handle. Must be safe to call when closed.
    fn close(&mut self);

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Acquisition state of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    /// No handle and no acquisition thread.
    Disconnected,
    /// Opening or reopening the device.
    Connecting,
    /// Frames are flowing.
    Running,
    /// Reconnect attempts exhausted; still retrying.
    Degraded,
}

/// Clockwise rotation applied to a camera's frames before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    /// No rotation.
    #[default]
    None,
    /// 90 degrees clockwise.
    Cw90,
    /// 180 degrees.
    Cw180,
    /// 270 degrees clockwise.
    Cw270,
}

impl Rotation {
    /// The next rotation in 90 degree steps.
    #[must_use]
    pub fn step(self) -> Self {
        match self {
            Rotation::None => Rotation::Cw90,
            Rotation::Cw90 => Rotation::Cw180,
            Rotation::Cw180 => Rotation::Cw270,
            Rotation::Cw270 => Rotation::None,
        }
    }

    /// Angle in degrees.
    pub fn degrees(self) -> u16 {
        u16::from(self)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees % 360 {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(format!("rotation must be a multiple of 90 degrees, got {other}")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

/// Timing and retry settings for one camera.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Attempts before the camera is reported degraded.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Minimum delay between reads.
    pub frame_interval: Duration,
    /// How long `stop()` waits for the thread to exit.
    pub stop_timeout: Duration,
    /// Initial rotation applied by consumers of this camera's frames.
    pub rotation: Rotation,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(2),
            frame_interval: Duration::from_millis(33),
            stop_timeout: Duration::from_secs(2),
            rotation: Rotation::None,
        }
    }
}

/// Snapshot of a camera for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    /// One-based camera index.
    pub index: u8,
    /// Acquisition state.
    pub state: CameraState,
    /// Consecutive failed reconnect attempts.
    pub reconnect_attempts: u32,
    /// Frames captured since start.
    pub frames_captured: u64,
    /// Source description.
    pub source: String,
    /// Configured rotation in degrees.
    pub rotation: u16,
}

struct CameraShared {
    state: RwLock<CameraState>,
    latest: Mutex<Option<Frame>>,
    running: AtomicBool,
    reconnect_attempts: AtomicU32,
    frames_captured: AtomicU64,
}

impl CameraShared {
    fn set_state(&self, state: CameraState) {
        *self.state.write() = state;
    }
}

/// Owns one camera's acquisition thread and latest-frame slot.
pub struct CameraManager {
    index: u8,
    settings: CameraSettings,
    description: String,
    rotation: Mutex<Rotation>,
    shared: Arc<CameraShared>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    thread: Mutex<Option<JoinHandle<Box<dyn FrameSource>>>>,
}

impl CameraManager {
    /// Create a stopped manager for camera `index` (one-based).
    pub fn new(index: u8, source: Box<dyn FrameSource>, settings: CameraSettings) -> Self {
        Self {
            index,
            description: source.describe(),
            rotation: Mutex::new(settings.rotation),
            settings,
            shared: Arc::new(CameraShared {
                state: RwLock::new(CameraState::Disconnected),
                latest: Mutex::new(None),
                running: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                frames_captured: AtomicU64::new(0),
            }),
            source: Mutex::new(Some(source)),
            thread: Mutex::new(None),
        }
    }

    /// One-based camera index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Rotation applied to this camera's frames.
    pub fn rotation(&self) -> Rotation {
        *self.rotation.lock()
    }

    /// Replace the rotation.
    pub fn set_rotation(&self, rotation: Rotation) {
        *self.rotation.lock() = rotation;
    }

    /// Advance the rotation by 90 degrees clockwise.
    pub fn rotate(&self) -> Rotation {
        let mut rotation = self.rotation.lock();
        *rotation = rotation.step();
        info!(camera = self.index, degrees = rotation.degrees(), "camera rotation changed");
        *rotation
    }

    /// Current acquisition state.
    pub fn state(&self) -> CameraState {
        *self.shared.state.read()
    }

    /// Whether the acquisition thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Open the device and start acquiring.
    ///
    /// A device that cannot be opened leaves the camera `Disconnected` and
    /// is reported through the returned state, not as an error.
    pub fn start(&self) -> CameraState {
        if self.is_running() {
            return self.state();
        }
        let Some(mut source) = self.source.lock().take() else {
            warn!(camera = self.index, "camera source still owned by a detached thread");
            return self.state();
        };

        self.shared.set_state(CameraState::Connecting);
        if let Err(e) = source.open() {
            warn!(camera = self.index, source = %self.description, error = %e, "camera failed to open");
            source.close();
            *self.source.lock() = Some(source);
            self.shared.set_state(CameraState::Disconnected);
            return CameraState::Disconnected;
        }

        self.shared.reconnect_attempts.store(0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(CameraState::Running);

        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let index = self.index;
        let spawned = std::thread::Builder::new()
            .name(format!("camera-{index}"))
            .spawn(move || acquisition_loop(index, source, &shared, &settings));

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!(camera = self.index, source = %self.description, "camera acquisition started");
                CameraState::Running
            }
            Err(e) => {
                // The source moved into the failed closure; nothing to restore.
                warn!(camera = self.index, error = %e, "failed to spawn acquisition thread");
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(CameraState::Disconnected);
                CameraState::Disconnected
            }
        }
    }

    /// Stop acquiring and release the device.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        let deadline = Instant::now() + self.settings.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(SLEEP_SLICE);
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(source) => *self.source.lock() = Some(source),
                Err(_) => warn!(camera = self.index, "acquisition thread panicked"),
            }
        } else {
            warn!(camera = self.index, "acquisition thread did not stop in time, detaching");
        }

        self.shared.latest.lock().take();
        self.shared.set_state(CameraState::Disconnected);
        info!(camera = self.index, "camera acquisition stopped");
    }

    /// Copy of the latest frame, if any. Never waits on acquisition.
    pub fn get_frame(&self) -> Option<Frame> {
        self.shared.latest.lock().clone()
    }

    /// Latest frame, or a placeholder for streaming consumers.
    pub fn frame_or_placeholder(&self) -> Frame {
        self.get_frame()
            .unwrap_or_else(|| Frame::placeholder(640, 480))
    }

    /// Latest frame or `CameraUnavailable`.
    pub fn require_frame(&self) -> FixtureResult<Frame> {
        self.get_frame()
            .ok_or(FixtureError::CameraUnavailable { camera: self.index })
    }

    /// Status snapshot.
    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            index: self.index,
            state: self.state(),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::Acquire),
            frames_captured: self.shared.frames_captured.load(Ordering::Acquire),
            source: self.description.clone(),
            rotation: self.rotation().degrees(),
        }
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

fn acquisition_loop(
    index: u8,
    mut source: Box<dyn FrameSource>,
    shared: &CameraShared,
    settings: &CameraSettings,
) -> Box<dyn FrameSource> {
    let mut connected = true;

    while shared.running.load(Ordering::Acquire) {
        if !connected {
            let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            let degraded = attempt > settings.reconnect_attempts;
            shared.set_state(if degraded {
                CameraState::Degraded
            } else {
                CameraState::Connecting
            });

            match source.open() {
                Ok(()) => {
                    connected = true;
                    shared.reconnect_attempts.store(0, Ordering::Release);
                    shared.set_state(CameraState::Running);
                    info!(camera = index, attempt, "camera reconnected");
                }
                Err(e) => {
                    if attempt == settings.reconnect_attempts + 1 {
                        warn!(camera = index, attempt, error = %e, "camera degraded, retrying in background");
                    } else {
                        debug!(camera = index, attempt, error = %e, "camera reconnect failed");
                    }
                    sleep_while_running(shared, settings.reconnect_backoff);
                }
            }
            continue;
        }

        match source.read_frame() {
            Ok(frame) => {
                *shared.latest.lock() = Some(frame);
                shared.frames_captured.fetch_add(1, Ordering::AcqRel);
                sleep_while_running(shared, settings.frame_interval);
            }
            Err(e) => {
                warn!(camera = index, error = %e, "frame read failed, reconnecting");
                source.close();
                connected = false;
            }
        }
    }

    source.close();
    source
}

fn sleep_while_running(shared: &CameraShared, total: Duration) {
    let deadline = Instant::now() + total;
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Frame source that re-reads an image file on every frame.
///
/// Suits bench setups where an external grabber keeps a snapshot file
/// current.
pub struct ImageFileSource {
    path: PathBuf,
    open: bool,
}

impl ImageFileSource {
    /// Source backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: false,
        }
    }
}

impl FrameSource for ImageFileSource {
    fn open(&mut self) -> FixtureResult<()> {
        if !self.path.is_file() {
            return Err(FixtureError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", self.path.display()),
            )));
        }
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> FixtureResult<Frame> {
        if !self.open {
            return Err(FixtureError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        let image = image::open(&self.path)
            .map_err(|e| FixtureError::Vision(format!("{}: {e}", self.path.display())))?;
        Ok(crate::vision::process::image_to_frame(&image))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Operator rotations kept across restarts, as JSON keyed by camera index.
#[derive(Debug, Clone)]
pub struct RotationStore {
    path: PathBuf,
}

impl RotationStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved rotations; empty when nothing was saved yet.
    pub fn load(&self) -> FixtureResult<BTreeMap<u8, Rotation>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map_err(|e| FixtureError::Serialization(format!("{}: {e}", self.path.display())))
    }

    /// Overwrite the saved rotations.
    pub fn save(&self, rotations: &BTreeMap<u8, Rotation>) -> FixtureResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(rotations).map_err(|e| FixtureError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), cameras = rotations.len(), "camera rotations saved");
        Ok(())
    }
}

/// The registered cameras, in index order.
pub struct CameraBank {
    cameras: Vec<Arc<CameraManager>>,
}

impl CameraBank {
    /// Bank over `cameras`.
    pub fn new(mut cameras: Vec<CameraManager>) -> Self {
        cameras.sort_by_key(CameraManager::index);
        Self {
            cameras: cameras.into_iter().map(Arc::new).collect(),
        }
    }

    /// All cameras in index order.
    pub fn cameras(&self) -> &[Arc<CameraManager>] {
        &self.cameras
    }

    /// Camera by one-based index.
    pub fn get(&self, index: u8) -> Option<&Arc<CameraManager>> {
        self.cameras.iter().find(|c| c.index() == index)
    }

    /// Start every camera; returns how many are running.
    pub fn start_all(&self) -> usize {
        self.cameras
            .iter()
            .filter(|camera| camera.start() == CameraState::Running)
            .count()
    }

    /// Stop every camera.
    pub fn stop_all(&self) {
        for camera in &self.cameras {
            camera.stop();
        }
    }

    /// Status of every camera.
    pub fn status(&self) -> Vec<CameraStatus> {
        self.cameras.iter().map(|c| c.status()).collect()
    }

    /// Current rotation of every camera.
    pub fn rotations(&self) -> BTreeMap<u8, Rotation> {
        self.cameras.iter().map(|c| (c.index(), c.rotation())).collect()
    }

    /// Apply saved rotations to the cameras they name.
    pub fn apply_rotations(&self, rotations: &BTreeMap<u8, Rotation>) {
        for (index, rotation) in rotations {
            match self.get(*index) {
                Some(camera) => camera.set_rotation(*rotation),
                None => debug!(camera = index, "saved rotation for an unregistered camera"),
            }
        }
    }
}
