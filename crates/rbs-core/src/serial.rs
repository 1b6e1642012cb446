//! Serial transport shared by every device channel.
//!
//! The fixture talks to three controllers over line-oriented serial links:
//! the motion stage (GRBL-style G-code), the relay/actuator board (short
//! `K2_1` style tokens) and the infrared receiver. This module only knows
//! about bytes; command semantics live in the root crate.
//!
//! # Types
//!
//! - [`ChannelRole`]: which controller a link belongs to
//! - [`SerialPortIO`]: anything that can stand in for a serial port
//! - [`DynSerial`]: type-erased boxed port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port (8N1, no flow control) off the runtime
//! - [`drain_serial_buffer`]: discard whatever is pending in the input buffer
//! - [`list_serial_ports`]: enumerate USB/ACM adapters

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::FixtureError;

/// Role of a device channel. At most one open handle exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Motion stage controller positioning the finger actuator.
    Motion,
    /// Relay/actuator board (press, lock, power, external trigger input).
    Relay,
    /// Infrared receiver.
    Infrared,
}

impl ChannelRole {
    /// All roles, in a stable order.
    pub const ALL: [ChannelRole; 3] = [ChannelRole::Motion, ChannelRole::Relay, ChannelRole::Infrared];

    /// Lowercase label used in logs and configuration keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelRole::Motion => "motion",
            ChannelRole::Relay => "relay",
            ChannelRole::Infrared => "infrared",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelRole {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "motion" => Ok(ChannelRole::Motion),
            "relay" => Ok(ChannelRole::Relay),
            "infrared" | "ir" => Ok(ChannelRole::Infrared),
            other => Err(FixtureError::Configuration(format!(
                "unknown channel role '{other}' (expected motion, relay or infrared)"
            ))),
        }
    }
}

/// Async byte stream usable as a serial port.
///
/// Implemented for `tokio_serial::SerialStream` on real hardware and for
/// `tokio::io::DuplexStream` in tests and simulation.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port with 8N1 framing and no flow control.
///
/// Opening touches the OS device and can block, so it runs on the blocking
/// pool.
///
/// # Errors
///
/// Returns an error if the device cannot be opened or the blocking task fails.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    role: ChannelRole,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("failed to open {role} port {path} at {baud_rate} baud"))
    })
    .await
    .context("serial open task panicked")?
}

/// Read and discard pending input until the line goes quiet or `window`
/// elapses. Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut scratch = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut scratch)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    discarded
}

/// A serial adapter visible to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub name: String,
    /// Adapter description when the OS reports one.
    pub description: Option<String>,
}

/// List USB and ACM serial adapters.
///
/// The fixture's controllers are all USB-attached; onboard UARTs are
/// filtered out.
///
/// # Errors
///
/// Returns an error if the OS port enumeration fails.
pub fn list_serial_ports() -> anyhow::Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|port| {
            let description = match &port.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => usb.product.clone(),
                _ => None,
            };
            let usb_like = matches!(port.port_type, tokio_serial::SerialPortType::UsbPort(_))
                || port.port_name.contains("USB")
                || port.port_name.contains("ACM");
            usb_like.then_some(PortInfo {
                name: port.port_name,
                description,
            })
        })
        .collect())
}
