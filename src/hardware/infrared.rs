//! Infrared capture.
//!
//! The press of a button on the device under test emits an infrared code.
//! Capturing it is best-effort: a failed or slow capture is recorded on the
//! button result and never affects approval or stops a run.
//!
//! Two backends implement [`InfraredCapture`]:
//!
//! - [`HttpInfraredClient`] asks the always-on receiver service over HTTP
//!   (`POST /get-nano/{target}`, health on `GET /status`).
//! - [`SerialInfraredReader`] polls a receiver attached directly to the
//!   infrared device channel (`GET`, then `PROTOCOL;HEX` lines, then
//!   `RESET`).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rbs_core::{ChannelRole, FixtureError, FixtureResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::channel::DeviceChannel;

/// Tag sent with every HTTP capture request.
pub const TRIGGER_SOURCE: &str = "RBS_FIXTURE_SEQUENCER";

/// One decoded infrared frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraredCode {
    /// Protocol name reported by the receiver (`NEC`, `SONY`, ...).
    pub protocol: String,
    /// Code in hexadecimal.
    pub hex: String,
}

/// Parse `PROTOCOL;HEX` lines. A hex field of `0` marks an undecodable
/// frame and is dropped.
pub fn parse_codes(text: &str) -> Vec<InfraredCode> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split(';');
            let protocol = parts.next()?.trim();
            let hex = parts.next()?.trim();
            if protocol.is_empty() || hex.is_empty() || hex == "0" {
                return None;
            }
            Some(InfraredCode {
                protocol: protocol.to_string(),
                hex: hex.to_ascii_uppercase(),
            })
        })
        .collect()
}

/// Set of codes known to come from a healthy device.
#[derive(Debug, Clone, Default)]
pub struct KnownCodes {
    codes: HashSet<String>,
}

impl KnownCodes {
    /// Load one hex code per line; blank lines and `#` comments are skipped.
    pub fn load(path: &Path) -> FixtureResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_lines(&text))
    }

    /// Build from newline-separated codes.
    pub fn from_lines(text: &str) -> Self {
        let codes = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_ascii_uppercase)
            .collect();
        Self { codes }
    }

    /// Whether any of `codes` is known.
    pub fn recognizes(&self, codes: &[InfraredCode]) -> bool {
        codes.iter().any(|c| self.codes.contains(&c.hex))
    }

    /// Number of known codes.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether no codes are known.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// A successful capture.
#[derive(Debug, Clone, Default)]
pub struct InfraredReading {
    /// Raw payload as reported by the receiver.
    pub payload: Option<Value>,
    /// Decoded frames found in the payload.
    pub codes: Vec<InfraredCode>,
    /// Collaborator request id, when provided.
    pub request_id: Option<String>,
    /// Collaborator timestamp, when provided.
    pub timestamp: Option<String>,
}

/// Source of infrared captures.
#[async_trait]
pub trait InfraredCapture: Send + Sync {
    /// Capture whatever the receiver `target` sees within `timeout`.
    async fn capture(&self, target: &str, timeout: Duration) -> FixtureResult<InfraredReading>;

    /// Health report of the backend; `None` when it has no health check.
    async fn status(&self) -> FixtureResult<Option<Value>> {
        Ok(None)
    }
}

/// What happened to a button's infrared capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraredOutcome {
    /// Whether a payload was received.
    pub success: bool,
    /// Receiver identifier.
    pub target: String,
    /// Decoded frames.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<InfraredCode>,
    /// Whether a decoded frame matched a known code (absent without a list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized: Option<bool>,
    /// Raw payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Collaborator request id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Collaborator timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InfraredOutcome {
    /// Outcome for a successful capture.
    pub fn captured(target: &str, reading: InfraredReading, known: Option<&KnownCodes>) -> Self {
        Self {
            success: true,
            target: target.to_string(),
            recognized: known.map(|k| k.recognizes(&reading.codes)),
            codes: reading.codes,
            payload: reading.payload,
            request_id: reading.request_id,
            timestamp: reading.timestamp,
            error: None,
        }
    }

    /// Outcome for a failed capture.
    pub fn failed(target: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            target: target.to_string(),
            codes: Vec::new(),
            recognized: None,
            payload: None,
            request_id: None,
            timestamp: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "payload")]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

fn codes_in(payload: &Value) -> Vec<InfraredCode> {
    match payload {
        Value::String(text) => parse_codes(text),
        Value::Array(items) => items.iter().flat_map(codes_in).collect(),
        Value::Object(map) => ["raw", "data", "code", "codes"]
            .iter()
            .filter_map(|key| map.get(*key))
            .flat_map(codes_in)
            .collect(),
        _ => Vec::new(),
    }
}

/// HTTP client for the infrared receiver service.
pub struct HttpInfraredClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInfraredClient {
    /// Client for the service at `base_url` with an overall request timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> FixtureResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rbs-fixture/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| FixtureError::Infrared(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Query `GET /status` on the receiver service.
    ///
    /// A body that is not JSON is returned as a string.
    pub async fn service_status(&self) -> FixtureResult<Value> {
        let url = format!("{}/status", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FixtureError::Infrared(format!("{url} unreachable: {e}")))?;

        let code = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FixtureError::Infrared(format!("{url}: {e}")))?;
        if !code.is_success() {
            return Err(FixtureError::Infrared(format!("{url} answered HTTP {}", code.as_u16())));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl InfraredCapture for HttpInfraredClient {
    #[instrument(skip(self), err)]
    async fn capture(&self, target: &str, timeout: Duration) -> FixtureResult<InfraredReading> {
        let url = format!("{}/get-nano/{}", self.base_url, target);
        let body = json!({
            "timeout": timeout.as_millis() as u64,
            "trigger_source": TRIGGER_SOURCE,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FixtureError::Infrared(format!("request to {url} failed: {e}")))?;

        match response.status().as_u16() {
            200 => {}
            408 => {
                return Err(FixtureError::Infrared(format!("{target} did not respond in time")));
            }
            503 => return Err(FixtureError::Infrared(format!("{target} is not connected"))),
            code => {
                let text = response.text().await.unwrap_or_default();
                return Err(FixtureError::Infrared(format!("HTTP {code}: {text}")));
            }
        }

        let parsed: CaptureResponse = response
            .json()
            .await
            .map_err(|e| FixtureError::Serialization(e.to_string()))?;
        if !parsed.success {
            return Err(FixtureError::Infrared(
                parsed.error.unwrap_or_else(|| "capture reported failure".to_string()),
            ));
        }

        Ok(InfraredReading {
            codes: parsed.data.as_ref().map(codes_in).unwrap_or_default(),
            payload: parsed.data,
            request_id: parsed.request_id,
            timestamp: parsed.timestamp.map(|t| match t {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        })
    }

    async fn status(&self) -> FixtureResult<Option<Value>> {
        self.service_status().await.map(Some)
    }
}

/// Receiver attached to the infrared device channel.
pub struct SerialInfraredReader {
    channel: Arc<DeviceChannel>,
    request: String,
    response_delay: Duration,
}

impl SerialInfraredReader {
    /// Reader over `channel`, which must be the infrared channel.
    pub fn new(channel: Arc<DeviceChannel>) -> FixtureResult<Self> {
        if channel.role() != ChannelRole::Infrared {
            return Err(FixtureError::ChannelUnavailable { role: channel.role() });
        }
        Ok(Self {
            channel,
            request: "GET".to_string(),
            response_delay: Duration::from_millis(500),
        })
    }

    /// Ask the receiver to clear its capture buffer.
    pub async fn reset(&self) -> FixtureResult<()> {
        self.channel.write_line("RESET", Duration::from_secs(1)).await
    }
}

#[async_trait]
impl InfraredCapture for SerialInfraredReader {
    async fn capture(&self, target: &str, timeout: Duration) -> FixtureResult<InfraredReading> {
        self.channel.write_line(&self.request, Duration::from_secs(1)).await?;
        tokio::time::sleep(self.response_delay).await;

        let window = timeout.saturating_sub(self.response_delay);
        let raw = self.channel.read_available(window).await?;
        if let Err(e) = self.reset().await {
            debug!(target, error = %e, "receiver reset failed");
        }
        let codes = parse_codes(&raw);
        if codes.is_empty() {
            warn!(target, raw = raw.trim(), "no decodable infrared frame");
            return Err(FixtureError::Infrared(format!("{target}: no decodable frame")));
        }

        Ok(InfraredReading {
            payload: Some(Value::String(raw.trim().to_string())),
            codes,
            request_id: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockController, MockControllerOptions};

    #[test]
    fn parses_protocol_hex_lines() {
        let codes = parse_codes("NEC;20df10ef\nSONY;0\ngarbage\n\nRC5;0C\n");
        assert_eq!(
            codes,
            vec![
                InfraredCode { protocol: "NEC".into(), hex: "20DF10EF".into() },
                InfraredCode { protocol: "RC5".into(), hex: "0C".into() },
            ]
        );
    }

    #[test]
    fn known_codes_ignore_comments_and_case() {
        let known = KnownCodes::from_lines("# power\n20df10ef\n\n");
        assert_eq!(known.len(), 1);
        assert!(known.recognizes(&parse_codes("NEC;20DF10EF")));
        assert!(!known.recognizes(&parse_codes("NEC;FFFF")));
    }

    #[test]
    fn codes_found_in_nested_payloads() {
        let payload = json!({ "raw": "NEC;A1", "data": ["SONY;B2"] });
        assert_eq!(codes_in(&payload).len(), 2);
    }

    #[test]
    fn outcome_marks_recognition_only_with_known_codes() {
        let reading = InfraredReading {
            codes: parse_codes("NEC;A1"),
            ..Default::default()
        };
        assert_eq!(InfraredOutcome::captured("nano1", reading.clone(), None).recognized, None);
        let known = KnownCodes::from_lines("A1");
        assert_eq!(InfraredOutcome::captured("nano1", reading, Some(&known)).recognized, Some(true));
    }

    #[tokio::test]
    async fn serial_reader_requests_and_parses() {
        let (port, mock) = MockController::spawn(ChannelRole::Infrared, MockControllerOptions::default());
        let channel = Arc::new(DeviceChannel::new(ChannelRole::Infrared));
        channel.attach(port, "mock-ir").await;
        let reader = SerialInfraredReader::new(Arc::clone(&channel)).unwrap();

        mock.inject("NEC;20DF10EF");
        let reading = reader.capture("nano1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(reading.codes[0].hex, "20DF10EF");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.received(), vec!["GET", "RESET"]);
    }

    /// Serve one canned HTTP response; returns the base URL and the request
    /// line received.
    async fn one_shot_server(status: &str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let status = status.to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let n = socket.read(&mut request).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let request = String::from_utf8_lossy(&request[..n]).into_owned();
            request.lines().next().unwrap_or_default().to_string()
        });
        (base, server)
    }

    #[tokio::test]
    async fn http_status_reports_service_health() {
        let (base, server) = one_shot_server("200 OK", r#"{"connected":true,"devices":["nano1"]}"#).await;
        let client = HttpInfraredClient::new(&base, Duration::from_secs(2)).unwrap();

        let status = client.status().await.unwrap().unwrap();
        assert_eq!(status["connected"], true);
        assert_eq!(server.await.unwrap(), "GET /status HTTP/1.1");
    }

    #[tokio::test]
    async fn http_status_fails_on_error_codes() {
        let (base, _server) = one_shot_server("503 Service Unavailable", "{}").await;
        let client = HttpInfraredClient::new(&base, Duration::from_secs(2)).unwrap();
        assert!(matches!(client.service_status().await, Err(FixtureError::Infrared(_))));
    }

    #[tokio::test]
    async fn http_status_fails_when_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = HttpInfraredClient::new(&base, Duration::from_secs(2)).unwrap();
        let err = client.service_status().await.unwrap_err();
        assert!(err.to_string().contains("unreachable"), "{err}");
    }

    #[tokio::test]
    async fn serial_reader_has_no_health_check() {
        let channel = Arc::new(DeviceChannel::new(ChannelRole::Infrared));
        let reader = SerialInfraredReader::new(channel).unwrap();
        assert_eq!(reader.status().await.unwrap(), None);
    }

    #[test]
    fn serial_reader_requires_infrared_role() {
        let channel = Arc::new(DeviceChannel::new(ChannelRole::Relay));
        assert!(SerialInfraredReader::new(channel).is_err());
    }
}
