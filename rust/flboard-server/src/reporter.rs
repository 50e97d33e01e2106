//! Logs the training progress of an orchestrator.

use flboard_core::{MetricsHistory, RoundState};
use flboard_sdk::{events::EventSubscriber, Phase};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Follows the events of an orchestrator until its training is over or
/// the orchestrator is gone, logging every change.
pub async fn report(events: EventSubscriber) {
    let mut phases = events.phase_listener();
    let mut states = events.round_state_listener();
    let mut metrics = events.metrics_listener();
    let mut errors = events.error_listener();

    let mut latest_state = states.get_latest();
    let mut latest_error = errors.get_latest();

    loop {
        let phase = phases.get_latest();
        if phase.is_terminal() {
            break;
        }
        tokio::select! {
            changed = phases.changed() => match changed {
                Some(phase) => info!("phase: {}", phase),
                None => break,
            },
            changed = states.changed() => match changed {
                Some(state) => {
                    if state != latest_state {
                        info!(
                            "{} ({:.0}%)",
                            state.status_line(latest_error.as_deref()),
                            state.progress_percent()
                        );
                    }
                    latest_state = state;
                }
                None => break,
            },
            changed = metrics.changed() => match changed {
                Some(history) => if let Some(round) = history.latest() {
                    debug!(
                        "round {}: test accuracy {:.2}%, epsilon {:.4}",
                        round.round_number,
                        round.global_metrics.test_accuracy * 100.0,
                        round.privacy_budget.epsilon
                    );
                },
                None => break,
            },
            changed = errors.changed() => match changed {
                Some(error) => {
                    if let Some(error) = &error {
                        warn!("{}", latest_state.status_line(Some(error)));
                    }
                    latest_error = error;
                }
                None => break,
            },
        }
    }

    let state = states.get_latest();
    let error = errors.get_latest();
    let history = metrics.get_latest();
    match phases.get_latest() {
        Phase::Failed => warn!("{}", summary(&state, &history, error.as_deref())),
        _ => info!("{}", summary(&state, &history, error.as_deref())),
    }
}

/// Waits for a spawned [`report`]. Returns `false` if it panicked.
pub async fn join(reporter: JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(e) => {
            warn!("progress reporter panicked: {}", e);
            false
        }
    }
}

/// Summarizes a training in one line.
pub fn summary(state: &RoundState, metrics: &MetricsHistory, error: Option<&str>) -> String {
    let mut line = state.status_line(error);
    let accuracy = metrics
        .latest()
        .map(|round| round.global_metrics.test_accuracy)
        .or(state.latest_accuracy);
    if let Some(accuracy) = accuracy {
        line.push_str(&format!(", test accuracy {:.2}%", accuracy * 100.0));
    }
    if let Some(round) = metrics.latest() {
        line.push_str(&format!(", epsilon {:.4}", round.privacy_budget.epsilon));
    }
    line
}
