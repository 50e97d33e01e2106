//! Per-round metrics reported by the training service.
//!
//! The metrics are opaque to us: they are computed by the service and
//! only rendered here. Fields the service leaves out default to zero
//! or empty.

use std::collections::BTreeMap;

/// Loss and accuracy of one client's local model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub accuracy: f64,
}

/// Loss and accuracy of the aggregated model on the test set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    #[serde(default)]
    pub test_loss: f64,
    #[serde(default)]
    pub test_accuracy: f64,
}

/// What the privacy mechanism did to the client updates of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyMetrics {
    #[serde(default)]
    pub noise_scale: f64,
    #[serde(default)]
    pub clip_norm: f64,
    #[serde(default)]
    pub clipped_updates: u64,
    #[serde(default)]
    pub original_update_norms: Vec<f64>,
    #[serde(default)]
    pub clipped_update_norms: Vec<f64>,
}

/// The privacy budget spent so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    #[serde(default)]
    pub epsilon: f64,
    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub noise_multiplier: f64,
    #[serde(default)]
    pub l2_norm_clip: f64,
}

/// The metrics of a single round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub round_number: u32,
    #[serde(default)]
    pub client_metrics: BTreeMap<String, ClientMetrics>,
    #[serde(default)]
    pub global_metrics: GlobalMetrics,
    #[serde(default)]
    pub privacy_metrics: PrivacyMetrics,
    #[serde(default)]
    pub privacy_budget: PrivacyBudget,
}

/// The metrics of all the rounds, in the order the service reported them.
///
/// The history is never edited locally: it is replaced as a whole with
/// the service's view after every successful poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsHistory(Vec<RoundMetrics>);

impl From<Vec<RoundMetrics>> for MetricsHistory {
    fn from(rounds: Vec<RoundMetrics>) -> Self {
        Self(rounds)
    }
}

impl MetricsHistory {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoundMetrics> {
        self.0.iter()
    }

    /// The most recently reported round.
    pub fn latest(&self) -> Option<&RoundMetrics> {
        self.0.last()
    }

    /// Looks up the metrics of a round.
    pub fn round(&self, round_number: u32) -> Option<&RoundMetrics> {
        self.0.iter().find(|m| m.round_number == round_number)
    }

    /// The test accuracy of the global model per round, in percent.
    pub fn accuracy_series(&self) -> Vec<(u32, f64)> {
        self.0
            .iter()
            .map(|m| (m.round_number, m.global_metrics.test_accuracy * 100.0))
            .collect()
    }

    /// The spent privacy budget (epsilon) per round.
    pub fn epsilon_series(&self) -> Vec<(u32, f64)> {
        self.0
            .iter()
            .map(|m| (m.round_number, m.privacy_budget.epsilon))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> MetricsHistory {
        serde_json::from_value(serde_json::json!([
            {
                "round_number": 1,
                "client_metrics": {
                    "client_1": { "loss": 0.9, "accuracy": 0.6 },
                    "client_2": { "loss": 1.1, "accuracy": 0.55 }
                },
                "global_metrics": { "test_loss": 0.8, "test_accuracy": 0.62 },
                "privacy_metrics": {
                    "noise_scale": 1.0,
                    "clip_norm": 1.0,
                    "clipped_updates": 1,
                    "original_update_norms": [1.4, 0.7],
                    "clipped_update_norms": [1.0, 0.7]
                },
                "privacy_budget": {
                    "epsilon": 0.8,
                    "delta": 1e-5,
                    "noise_multiplier": 1.0,
                    "l2_norm_clip": 1.0
                }
            },
            {
                "round_number": 2,
                "global_metrics": { "test_loss": 0.6, "test_accuracy": 0.75 },
                "privacy_budget": { "epsilon": 1.3, "delta": 1e-5 }
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_parse_history() {
        let history = history();
        assert_eq!(history.len(), 2);
        let first = history.round(1).unwrap();
        assert_eq!(first.client_metrics.len(), 2);
        assert_eq!(first.privacy_metrics.clipped_updates, 1);
        // missing sections default
        let second = history.latest().unwrap();
        assert_eq!(second.round_number, 2);
        assert!(second.client_metrics.is_empty());
        assert_eq!(second.privacy_metrics, PrivacyMetrics::default());
    }

    #[test]
    fn test_series() {
        let history = history();
        let accuracy = history.accuracy_series();
        assert_eq!(accuracy.len(), 2);
        assert_eq!(accuracy[0].0, 1);
        assert!((accuracy[1].1 - 75.0).abs() < 1e-9);
        assert_eq!(history.epsilon_series(), vec![(1, 0.8), (2, 1.3)]);
        assert!(MetricsHistory::default().latest().is_none());
    }
}
