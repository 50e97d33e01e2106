//! JSON bodies of the training service API.
//!
//! | method | path                          | response                  |
//! |--------|-------------------------------|---------------------------|
//! | POST   | `/api/session/new`            | [`NewSessionResponse`]    |
//! | GET    | `/api/session/{id}/status`    | [`SessionStatusResponse`] |
//! | POST   | `/api/fl/initialize`          | [`StatusResponse`]        |
//! | POST   | `/api/fl/train_round`         | [`TrainRoundResponse`]    |
//! | GET    | `/api/fl/current_state`       | [`CurrentStateResponse`]  |
//! | GET    | `/api/fl/metrics`             | [`MetricsResponse`]       |
//! | POST   | `/api/fl/reset`               | [`StatusResponse`]        |
//!
//! The body of `initialize` is a [`TrainingConfiguration`]. Every
//! `/api/fl` request carries the session in the [`SESSION_HEADER`].
//!
//! [`TrainingConfiguration`]: crate::TrainingConfiguration

use crate::{metrics::RoundMetrics, state::PrivacySettings, SessionId};

/// The header that carries the session identifier.
pub const SESSION_HEADER: &str = "X-Session-ID";

pub const NEW_SESSION_PATH: &str = "/api/session/new";
pub const INITIALIZE_PATH: &str = "/api/fl/initialize";
pub const TRAIN_ROUND_PATH: &str = "/api/fl/train_round";
pub const CURRENT_STATE_PATH: &str = "/api/fl/current_state";
pub const METRICS_PATH: &str = "/api/fl/metrics";
pub const RESET_PATH: &str = "/api/fl/reset";

/// The path of the status endpoint of a session.
pub fn session_status_path(id: &SessionId) -> String {
    format!("/api/session/{}/status", id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionResponse {
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub valid: bool,
}

/// A plain acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainRoundResponse {
    #[serde(default)]
    pub status: String,
    /// The metrics of the round that just finished, kept opaque.
    #[serde(default)]
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStateResponse {
    #[serde(default)]
    pub status: String,
    pub current_round: u32,
    pub total_rounds: u32,
    #[serde(default)]
    pub privacy_settings: Option<PrivacySettings>,
    pub training_active: bool,
    #[serde(default)]
    pub latest_accuracy: Option<f64>,
}

impl CurrentStateResponse {
    /// Whether the service reached the last round or stopped training.
    pub fn is_finished(&self) -> bool {
        self.current_round >= self.total_rounds || !self.training_active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    #[serde(default)]
    pub rounds: Vec<u32>,
    #[serde(default)]
    pub training_metrics: Vec<RoundMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub training_history: TrainingHistory,
}

/// The body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Extracts a human readable message from the body of a failed request:
/// the `error` field if the body is a JSON error, the raw text otherwise.
pub fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => error,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}
