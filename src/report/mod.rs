//! Heartbeat reporter. Performs one report exchange with the remote server
//! per call and classifies the response.

use std::time::Duration;

use serde::Serialize;
use tracing::{Span, field, instrument, warn};

use crate::config::{DeviceConfig, TlsPolicy};
use crate::util::http::{Client, ClientError, InvalidUriError, Method, StatusCode, Uri};
use crate::util::types::DeviceToken;

/// Path of the heartbeat endpoint relative to the server base address
pub const HEARTBEAT_PATH: &str = "/api/heartbeat";

/// Header carrying the device token
pub const TOKEN_HEADER: &str = "X-Device-Token";

/// Upper bound for a single report exchange
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of a heartbeat report
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    /// Signal strength in dBm
    pub rssi: i32,
    /// Seconds since boot
    pub uptime: u64,
    /// Free memory in bytes
    pub heap: u64,
}

/// Classified result of one report exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Success,
    /// The server rejected the token or reported a conflicting registration
    AuthRejected,
    RateLimited,
    /// Any other status code or a transport error
    TransientFailure,
}

impl From<StatusCode> for ReportOutcome {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::OK => ReportOutcome::Success,
            StatusCode::UNAUTHORIZED | StatusCode::CONFLICT => ReportOutcome::AuthRejected,
            StatusCode::TOO_MANY_REQUESTS => ReportOutcome::RateLimited,
            _ => ReportOutcome::TransientFailure,
        }
    }
}

/// A single report attempt. Retries are the caller's business.
#[allow(async_fn_in_trait)]
pub trait Report {
    async fn send_report(&mut self, telemetry: &Telemetry) -> ReportOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("invalid heartbeat endpoint: {0}")]
    Endpoint(#[from] InvalidUriError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Sends heartbeats with `POST /api/heartbeat`
pub struct HeartbeatReporter {
    client: Client,
    endpoint: Uri,
    token: DeviceToken,
}

impl HeartbeatReporter {
    pub fn new(config: &DeviceConfig) -> Result<Self, ReporterError> {
        let endpoint = Uri::join(&config.server, HEARTBEAT_PATH)?;
        let insecure = config.tls == TlsPolicy::Insecure && endpoint.is_secure();
        if insecure {
            warn!("TLS certificate validation is disabled for {endpoint}");
        }

        let client = Client::new(Some(ATTEMPT_TIMEOUT), insecure)?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }
}

impl Report for HeartbeatReporter {
    #[instrument(name = "heartbeat", level = "debug", skip_all, fields(response = field::Empty))]
    async fn send_report(&mut self, telemetry: &Telemetry) -> ReportOutcome {
        let response = self
            .client
            .request(Method::POST, &self.endpoint, |request| {
                request
                    .header(TOKEN_HEADER, self.token.as_str())
                    .header("Connection", "close")
                    // sets Content-Type: application/json
                    .json(telemetry)
            })
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                Span::current().record("response", field::display(status));
                let outcome = ReportOutcome::from(status);
                if outcome != ReportOutcome::Success {
                    warn!("server responded with {status}");
                }
                outcome
            }
            Err(e) => {
                warn!("heartbeat request failed: {e}");
                ReportOutcome::TransientFailure
            }
        }
    }
}
