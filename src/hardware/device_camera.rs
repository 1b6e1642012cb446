//! Camera devices through `nokhwa`.
//!
//! The capture handle lives on its own worker thread and the source talks
//! to it over channels, so the source stays `Send` whatever the platform
//! backend is. The acquisition thread asks for one frame per read.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use rbs_core::{FixtureError, FixtureResult, Frame};
use tracing::{debug, info, warn};

use super::camera::FrameSource;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

fn device_error(index: u32, message: impl std::fmt::Display) -> FixtureError {
    FixtureError::Io(std::io::Error::other(format!("camera device {index}: {message}")))
}

struct Worker {
    requests: Sender<()>,
    frames: Receiver<FixtureResult<Frame>>,
    handle: JoinHandle<()>,
}

/// Frame source reading a local camera device by index.
pub struct DeviceFrameSource {
    index: u32,
    worker: Option<Worker>,
}

impl DeviceFrameSource {
    /// Source for the device at `index` (zero-based, as the OS lists them).
    pub fn new(index: u32) -> Self {
        Self { index, worker: None }
    }
}

impl FrameSource for DeviceFrameSource {
    fn open(&mut self) -> FixtureResult<()> {
        self.close();

        let index = self.index;
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, String>>();
        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (frame_tx, frame_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(format!("camera-device-{index}"))
            .spawn(move || capture_worker(index, &ready_tx, &request_rx, &frame_tx))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(name)) => {
                info!(device = index, name = %name, "camera device opened");
                self.worker = Some(Worker {
                    requests: request_tx,
                    frames: frame_rx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => Err(device_error(index, e)),
            Err(_) => Err(device_error(index, "timed out opening device")),
        }
    }

    fn read_frame(&mut self) -> FixtureResult<Frame> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(FixtureError::Io(std::io::ErrorKind::NotConnected.into()));
        };
        if worker.requests.send(()).is_err() {
            return Err(device_error(self.index, "capture thread exited"));
        }
        match worker.frames.recv_timeout(READ_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(device_error(self.index, "frame timed out")),
            Err(RecvTimeoutError::Disconnected) => Err(device_error(self.index, "capture thread exited")),
        }
    }

    fn close(&mut self) {
        // Dropping the request sender ends the worker loop. A worker stuck
        // in the driver is left to finish on its own.
        if let Some(worker) = self.worker.take() {
            drop(worker.requests);
            if worker.handle.is_finished() && worker.handle.join().is_err() {
                warn!(device = self.index, "camera device thread panicked");
            }
        }
    }

    fn describe(&self) -> String {
        format!("device:{}", self.index)
    }
}

impl Drop for DeviceFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_worker(
    index: u32,
    ready: &Sender<Result<String, String>>,
    requests: &Receiver<()>,
    frames: &Sender<FixtureResult<Frame>>,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let opened = Camera::new(CameraIndex::Index(index), format).and_then(|mut camera| {
        camera.open_stream()?;
        Ok(camera)
    });
    let mut camera = match opened {
        Ok(camera) => {
            let _ = ready.send(Ok(camera.info().human_name()));
            camera
        }
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    while requests.recv().is_ok() {
        let frame = camera
            .frame()
            .and_then(|buffer| buffer.decode_image::<RgbFormat>())
            .map(|rgb| Frame::rgb(rgb.width(), rgb.height(), rgb.into_raw()))
            .map_err(|e| device_error(index, e));
        if frames.send(frame).is_err() {
            break;
        }
    }

    if let Err(e) = camera.stop_stream() {
        debug!(device = index, error = %e, "stop_stream failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopened_device_is_not_connected() {
        let mut source = DeviceFrameSource::new(7);
        assert_eq!(source.describe(), "device:7");
        assert!(source.read_frame().is_err());
        source.close();
    }
}
