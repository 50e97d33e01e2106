use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval, sleep, sleep_until, MissedTickBehavior},
};
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    cancel::{self, Signal, Token},
    events::EventListener,
    orchestrator::{OrchestratorError, Phase, RoundOutcome, SkipReason},
    Orchestrator,
    TrainingClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// The pause between two round triggers.
    pub round_interval: Duration,
    /// The pause between two polls of the training state.
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            round_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Runs the loops that drive an initialized [`Orchestrator`]:
///
/// - the round loop triggers a round every `round_interval`, the first
///   one right away
/// - the poll loop refreshes the training state every `poll_interval`,
///   the first time right away
/// - the renewal loop renews the session ahead of its expiry
///
/// Each loop owns a cancellation token and ends on its own once the
/// training is over.
pub struct Scheduler {
    signals: Vec<Signal>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start<T>(orchestrator: Arc<Orchestrator<T>>, settings: SchedulerSettings) -> Self
    where
        T: TrainingClient,
    {
        let mut signals = Vec::with_capacity(3);
        let mut handles = Vec::with_capacity(3);

        let (signal, token) = cancel::channel();
        signals.push(signal);
        handles.push(tokio::spawn(
            round_loop(orchestrator.clone(), settings.round_interval, token)
                .instrument(error_span!("round_loop")),
        ));

        let (signal, token) = cancel::channel();
        signals.push(signal);
        handles.push(tokio::spawn(
            poll_loop(orchestrator.clone(), settings.poll_interval, token)
                .instrument(error_span!("poll_loop")),
        ));

        let (signal, token) = cancel::channel();
        signals.push(signal);
        handles.push(tokio::spawn(
            renewal_loop(orchestrator, settings.poll_interval, token)
                .instrument(error_span!("renewal_loop")),
        ));

        Self { signals, handles }
    }

    /// Waits until every loop ended on its own.
    ///
    /// Cancel safe: a loop is forgotten only once it ended.
    pub async fn finished(&mut self) {
        while let Some(handle) = self.handles.first_mut() {
            if let Err(e) = handle.await {
                warn!("scheduling loop panicked: {}", e);
            }
            self.handles.remove(0);
        }
    }

    /// Cancels the loops and waits until they all stopped. A round or a
    /// poll that is underway completes first.
    pub async fn shutdown(mut self) {
        info!("stopping the scheduling loops");
        futures::future::join_all(self.signals.drain(..).map(Signal::cancel)).await;
        self.finished().await;
    }
}

async fn round_loop<T>(orchestrator: Arc<Orchestrator<T>>, period: Duration, mut token: Token)
where
    T: TrainingClient,
{
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticks.tick() => {}
        }
        match orchestrator.execute_round().await {
            Ok(RoundOutcome::Skipped(SkipReason::Terminal)) => break,
            Ok(outcome) => debug!("round trigger: {:?}", outcome),
            Err(OrchestratorError::FailureBudgetExhausted(_)) => break,
            Err(e) => debug!("round trigger failed: {}", e),
        }
        if orchestrator.is_terminal().await {
            break;
        }
    }
    debug!("round loop stopped");
}

async fn poll_loop<T>(orchestrator: Arc<Orchestrator<T>>, period: Duration, mut token: Token)
where
    T: TrainingClient,
{
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if orchestrator.is_terminal().await {
            break;
        }
        match orchestrator.poll_state().await {
            Ok((state, _)) => debug!(
                "polled round {}/{}",
                state.current_round, state.total_rounds
            ),
            Err(e) => warn!("failed to poll the training state: {}", e),
        }
        if orchestrator.is_terminal().await {
            break;
        }
    }
    debug!("poll loop stopped");
}

/// Renews the session when its renewal deadline is reached. Without a
/// session, checks again every `idle_period`.
async fn renewal_loop<T>(orchestrator: Arc<Orchestrator<T>>, idle_period: Duration, mut token: Token)
where
    T: TrainingClient,
{
    let mut phases: EventListener<Phase> = orchestrator.subscribe().phase_listener();
    loop {
        if phases.get_latest().is_terminal() {
            break;
        }
        let renew_at = orchestrator.renew_at().await;
        tokio::select! {
            _ = token.cancelled() => break,
            phase = phases.changed() => match phase {
                Some(phase) if phase.is_terminal() => break,
                Some(_) => continue,
                None => break,
            },
            _ = wait_until(renew_at, idle_period) => {}
        }
        // the session may have been replaced meanwhile
        if !orchestrator.needs_renewal().await {
            continue;
        }
        match orchestrator.acquire_session(true).await {
            Ok(id) => debug!("session {} renewed", id),
            Err(e) => {
                warn!("failed to renew the session: {}", e);
                break;
            }
        }
    }
    debug!("renewal loop stopped");
}

async fn wait_until(deadline: Option<tokio::time::Instant>, idle_period: Duration) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => sleep(idle_period).await,
    }
}
