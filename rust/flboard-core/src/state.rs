use derive_more::Display;

use crate::api::CurrentStateResponse;

/// The number of rounds assumed until the service reported its own.
pub const DEFAULT_TOTAL_ROUNDS: u32 = 10;

/// The coarse training status shown to the user.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrainingStatus {
    #[display(fmt = "Initializing")]
    Initializing,
    #[display(fmt = "Training")]
    Training,
    #[display(fmt = "Complete")]
    Complete,
    #[display(fmt = "Failed")]
    Failed,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// The differential privacy parameters the service trains with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacySettings {
    pub noise_multiplier: f64,
    pub l2_norm_clip: f64,
}

/// The training progress, as last reconciled with the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    pub current_round: u32,
    pub total_rounds: u32,
    pub training_active: bool,
    pub latest_accuracy: Option<f64>,
    pub status: TrainingStatus,
    pub privacy_settings: Option<PrivacySettings>,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            current_round: 0,
            total_rounds: DEFAULT_TOTAL_ROUNDS,
            training_active: false,
            latest_accuracy: None,
            status: TrainingStatus::Initializing,
            privacy_settings: None,
        }
    }
}

impl RoundState {
    /// Merges a state fetched from the service into this one.
    ///
    /// Everything but the round counter is taken over from `fetched`.
    /// The round counter never goes backwards and never exceeds the
    /// total number of rounds, even if responses arrive out of order.
    /// The bound wins over the monotonicity: if the service lowers the
    /// total below the counter, the counter drops to the new total.
    /// A fetched state that reached the last round or that is no
    /// longer active completes the training.
    pub fn reconcile(&self, fetched: &CurrentStateResponse) -> Self {
        let total_rounds = fetched.total_rounds;
        let current_round = self.current_round.max(fetched.current_round).min(total_rounds);
        let status = if fetched.is_finished() {
            TrainingStatus::Complete
        } else if self.status.is_terminal() {
            self.status
        } else {
            TrainingStatus::Training
        };
        Self {
            current_round,
            total_rounds,
            training_active: fetched.training_active,
            latest_accuracy: fetched.latest_accuracy,
            status,
            privacy_settings: fetched.privacy_settings,
        }
    }

    /// Whether the service reached the end of the training.
    pub fn is_finished(&self) -> bool {
        self.current_round >= self.total_rounds || !self.training_active
    }

    /// The share of completed rounds, in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.total_rounds == 0 {
            return 0.0;
        }
        f64::from(self.current_round) / f64::from(self.total_rounds) * 100.0
    }

    /// A one-line summary of the training, `error` taking precedence.
    pub fn status_line(&self, error: Option<&str>) -> String {
        if let Some(error) = error {
            format!("Error: {}", error)
        } else if self.status == TrainingStatus::Complete
            || (self.total_rounds > 0 && self.current_round == self.total_rounds)
        {
            "Training Complete!".to_string()
        } else {
            format!(
                "Training in Progress - Round {}/{}",
                self.current_round, self.total_rounds
            )
        }
    }
}
