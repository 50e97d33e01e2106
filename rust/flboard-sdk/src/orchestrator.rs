//! The session-bound training orchestrator.
//!
//! The [`Orchestrator`] owns the session with the training service and
//! drives the training against it: it submits the configuration, runs
//! the rounds and reconciles its view of the training with the state
//! the service reports.
//!
//! ```text
//! Idle -> Initializing -> Training <-> Polling -> Complete
//!                                             \-> Failed
//! ```
//!
//! Failures never escape as panics. Each operation returns a typed
//! error and publishes a user-visible message through the
//! [`EventSubscriber`]. Round failures count toward a failure budget,
//! and an invalid session is renewed instead.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use derive_more::Display;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use flboard_core::{
    api::CurrentStateResponse,
    ClientSetup,
    MetricsHistory,
    RoundState,
    SessionId,
    TrainingConfiguration,
    TrainingStatus,
    ValidationError,
};

use crate::{
    client::ClientError,
    events::{EventPublisher, EventSubscriber},
    retry::{retry, RetryPolicy},
    session::{Session, SessionPolicy},
    TrainingClient,
};

/// The phase of the training, per session.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Initializing")]
    Initializing,
    #[display(fmt = "Training")]
    Training,
    #[display(fmt = "Polling")]
    Polling,
    #[display(fmt = "Complete")]
    Complete,
    #[display(fmt = "Failed")]
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Error returned when no valid session could be obtained.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("the training service is unreachable: {0}")]
    Unreachable(String),

    #[error("the training service refused the session request: {0}")]
    Refused(String),

    #[error("the training service did not provide a session id")]
    NoSessionId,

    #[error("the session request timed out")]
    Timeout,

    #[error("the session is no longer valid")]
    Invalid,

    #[error("no session was acquired yet")]
    Missing,
}

impl From<ClientError> for SessionError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::SessionInvalid => Self::Invalid,
            ClientError::Timeout => Self::Timeout,
            ClientError::NoSessionId => Self::NoSessionId,
            ClientError::Service { message, .. } => Self::Refused(message),
            e => Self::Unreachable(e.to_string()),
        }
    }
}

/// Error returned by the [`Orchestrator`] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Initialization(String),

    #[error("Request timed out")]
    Timeout,

    #[error("{message}")]
    Service { status: u16, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("the training was already initialized for this session")]
    AlreadyInitialized,

    #[error("the training is not initialized")]
    NotInitialized,

    #[error("Training failed after {0} attempts. Please try again.")]
    FailureBudgetExhausted(u32),

    #[error("{0}")]
    Transport(String),
}

impl From<ClientError> for OrchestratorError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::SessionInvalid => Self::Session(SessionError::Invalid),
            ClientError::NoSessionId => Self::Session(SessionError::NoSessionId),
            ClientError::Timeout => Self::Timeout,
            ClientError::Service { status, message } => Self::Service { status, message },
            e => Self::Transport(e.to_string()),
        }
    }
}

impl OrchestratorError {
    /// The message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Session(_) => "Failed to initialize session".to_string(),
            Self::Initialization(message) => format!("Failed to initialize training: {}", message),
            e => e.to_string(),
        }
    }

    fn initialization(e: ClientError) -> Self {
        match e {
            ClientError::Service { message, .. } => Self::Initialization(message),
            ClientError::Http(message) => Self::Initialization(message),
            e => e.into(),
        }
    }
}

/// Why [`Orchestrator::execute_round`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another round is still in flight.
    InFlight,
    /// The training is complete or failed.
    Terminal,
    /// No configuration was submitted yet.
    NotInitialized,
}

/// The outcome of [`Orchestrator::execute_round`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Skipped(SkipReason),
    /// The service rejected the session. A new one was acquired and the
    /// round will be attempted again on the next trigger.
    SessionRenewed,
    /// The round was run. `reconciled` tells whether a subsequent poll
    /// reflected it.
    Dispatched { reconciled: bool },
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// The number of consecutive round failures after which the training fails.
    pub max_round_failures: u32,
    /// How the state is polled after a round until it reflects the round.
    pub reconcile: RetryPolicy,
    pub session: SessionPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_round_failures: 3,
            reconcile: RetryPolicy::new(3, std::time::Duration::from_secs(2)),
            session: SessionPolicy::default(),
        }
    }
}

struct State {
    phase: Phase,
    /// The session the round state and metrics belong to.
    session: Option<SessionId>,
    config: Option<TrainingConfiguration>,
    /// The session the configuration was last submitted for.
    initialized_for: Option<SessionId>,
    round_state: RoundState,
    metrics: MetricsHistory,
    error: Option<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            session: None,
            config: None,
            initialized_for: None,
            round_state: RoundState::default(),
            metrics: MetricsHistory::default(),
            error: None,
        }
    }
}

/// Resets the in-flight flag when a round ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the training of one user against the training service.
///
/// The orchestrator is meant to be shared behind an `Arc`: every
/// operation takes `&self`. Rounds never overlap, polls may.
pub struct Orchestrator<T> {
    client: T,
    settings: OrchestratorSettings,
    /// Locked for the whole acquisition, so that concurrent callers
    /// don't request several sessions. Locked before `state` if both are.
    session: Mutex<Option<Session>>,
    state: Mutex<State>,
    round_in_flight: AtomicBool,
    failures: AtomicU32,
    events: EventPublisher,
    subscriber: EventSubscriber,
}

impl<T> Orchestrator<T>
where
    T: TrainingClient,
{
    pub fn new(client: T, settings: OrchestratorSettings) -> Self {
        let (events, subscriber) = EventPublisher::init(Phase::Idle, RoundState::default());
        Self {
            client,
            settings,
            session: Mutex::new(None),
            state: Mutex::new(State::default()),
            round_in_flight: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            events,
            subscriber,
        }
    }

    /// Hands out listeners for the observable state.
    pub fn subscribe(&self) -> EventSubscriber {
        self.subscriber.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn round_state(&self) -> RoundState {
        self.state.lock().await.round_state.clone()
    }

    pub async fn metrics(&self) -> MetricsHistory {
        self.state.lock().await.metrics.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.lock().await.error.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.session.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// The instant from which on the current session should be renewed.
    pub async fn renew_at(&self) -> Option<Instant> {
        self.session.lock().await.as_ref().map(Session::renew_at)
    }

    pub async fn is_terminal(&self) -> bool {
        self.phase().await.is_terminal()
    }

    /// Whether the renewal deadline of the current session passed.
    pub async fn needs_renewal(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(false, Session::needs_renewal)
    }

    /// Returns a session id, requesting one if necessary.
    ///
    /// Without `renew`, a cached session that did not expire is returned
    /// as is. With `renew`, the cached session is kept only if the
    /// service confirms it is still valid.
    ///
    /// # Errors
    /// Fails if no session could be obtained. The training is then
    /// marked as failed.
    pub async fn acquire_session(&self, renew: bool) -> Result<SessionId, OrchestratorError> {
        let mut slot = self.session.lock().await;
        let acquired = self.acquire(&mut slot, renew).await;
        drop(slot);
        match acquired {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("failed to acquire a session: {}", e);
                let e = OrchestratorError::from(e);
                self.fail_session(&e).await;
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        slot: &mut Option<Session>,
        renew: bool,
    ) -> Result<SessionId, SessionError> {
        if let Some(session) = slot.as_mut() {
            if !renew && !session.is_expired() {
                return Ok(session.id.clone());
            }
            if renew {
                match self.client.session_status(&session.id).await {
                    Ok(true) => {
                        debug!("session {} is still valid", session.id);
                        session.extend(self.settings.session);
                        return Ok(session.id.clone());
                    }
                    Ok(false) => info!("session {} is no longer valid", session.id),
                    Err(e) => warn!("failed to check session {}: {}", session.id, e),
                }
            }
        }

        let id = self.client.new_session().await?;
        info!("acquired session {}", id);
        *slot = Some(Session::new(id.clone(), self.settings.session));

        let mut state = self.state.lock().await;
        state.session = Some(id.clone());
        state.round_state = RoundState {
            status: state.round_state.status,
            training_active: state.round_state.training_active,
            ..RoundState::default()
        };
        state.metrics = MetricsHistory::default();
        self.publish(&state);
        Ok(id)
    }

    async fn fail_session(&self, error: &OrchestratorError) {
        let mut state = self.state.lock().await;
        state.phase = Phase::Failed;
        state.round_state.training_active = false;
        state.round_state.status = TrainingStatus::Failed;
        state.error = Some(error.user_message());
        self.publish(&state);
    }

    /// Derives the configuration from a client setup and submits it.
    ///
    /// # Errors
    /// Fails without contacting the service if the setup can't be
    /// configured, see [`ClientSetup::configure`].
    pub async fn initialize_from_setup(
        &self,
        setup: &ClientSetup,
        template: TrainingConfiguration,
    ) -> Result<(), OrchestratorError> {
        let config = match setup.configure(template) {
            Ok(config) => config,
            Err(e) => return Err(self.reject(e).await),
        };
        self.initialize_training(config).await
    }

    /// Submits the training configuration under the current session.
    ///
    /// The configuration is submitted at most once per session. On
    /// failure, nothing is kept and the orchestrator returns to
    /// [`Phase::Idle`].
    pub async fn initialize_training(
        &self,
        config: TrainingConfiguration,
    ) -> Result<(), OrchestratorError> {
        if let Err(e) = config.validate() {
            return Err(self.reject(e).await);
        }
        let session = self.acquire_session(false).await?;

        {
            let mut state = self.state.lock().await;
            if state.phase == Phase::Initializing
                || state.initialized_for.as_ref() == Some(&session)
            {
                return Err(OrchestratorError::AlreadyInitialized);
            }
            state.phase = Phase::Initializing;
            self.publish(&state);
        }

        info!("initializing the training for session {}", session);
        let result = self
            .client
            .initialize(&session, &config)
            .await
            .map_err(OrchestratorError::initialization);

        let mut state = self.state.lock().await;
        match result {
            Ok(_) => {
                info!(
                    "training initialized with {} clients, {} local epochs",
                    config.num_clients, config.local_epochs
                );
                self.failures.store(0, Ordering::Release);
                state.config = Some(config);
                state.initialized_for = Some(session);
                state.phase = Phase::Training;
                state.round_state = RoundState {
                    training_active: true,
                    status: TrainingStatus::Training,
                    ..RoundState::default()
                };
                state.error = None;
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                warn!("failed to initialize the training: {}", e);
                state.phase = Phase::Idle;
                state.error = Some(e.user_message());
                self.publish(&state);
                Err(e)
            }
        }
    }

    async fn reject(&self, e: ValidationError) -> OrchestratorError {
        let e = OrchestratorError::from(e);
        let mut state = self.state.lock().await;
        state.error = Some(e.user_message());
        self.publish(&state);
        e
    }

    /// Runs one training round, unless one is already in flight or the
    /// training is over.
    ///
    /// # Errors
    /// A failed round counts toward the failure budget. The error that
    /// exhausts it is [`OrchestratorError::FailureBudgetExhausted`].
    pub async fn execute_round(&self) -> Result<RoundOutcome, OrchestratorError> {
        if self
            .round_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("a round is already in flight, skipping");
            return Ok(RoundOutcome::Skipped(SkipReason::InFlight));
        }
        let _in_flight = InFlight(&self.round_in_flight);
        self.run_round().await
    }

    async fn run_round(&self) -> Result<RoundOutcome, OrchestratorError> {
        let (config, initialized_for, previous_round) = {
            let state = self.state.lock().await;
            if state.phase.is_terminal()
                || state.round_state.current_round >= state.round_state.total_rounds
            {
                debug!("the training is over, skipping the round");
                return Ok(RoundOutcome::Skipped(SkipReason::Terminal));
            }
            match state.config {
                Some(config) => (
                    config,
                    state.initialized_for.clone(),
                    state.round_state.current_round,
                ),
                None => return Ok(RoundOutcome::Skipped(SkipReason::NotInitialized)),
            }
        };

        let session = self.acquire_session(false).await?;

        if initialized_for.as_ref() != Some(&session) {
            info!("resubmitting the configuration for session {}", session);
            match self.client.initialize(&session, &config).await {
                Ok(_) => self.state.lock().await.initialized_for = Some(session.clone()),
                Err(ClientError::SessionInvalid) => return self.renew_after_rejection().await,
                Err(e) => return Err(self.round_failed(OrchestratorError::initialization(e)).await),
            }
        }

        self.set_phase(Phase::Training).await;
        match self.client.train_round(&session).await {
            Ok(_) => {
                self.failures.store(0, Ordering::Release);
                info!("round {} dispatched", previous_round + 1);
                self.set_phase(Phase::Polling).await;
                let reconciled = self.reconcile(&session, previous_round).await;
                Ok(RoundOutcome::Dispatched { reconciled })
            }
            Err(ClientError::SessionInvalid) => self.renew_after_rejection().await,
            Err(e) => Err(self.round_failed(e.into()).await),
        }
    }

    async fn renew_after_rejection(&self) -> Result<RoundOutcome, OrchestratorError> {
        warn!("the service rejected the session, renewing it");
        self.acquire_session(true).await?;
        self.set_phase(Phase::Polling).await;
        Ok(RoundOutcome::SessionRenewed)
    }

    async fn round_failed(&self, error: OrchestratorError) -> OrchestratorError {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let max_failures = self.settings.max_round_failures;
        let mut state = self.state.lock().await;
        if failures >= max_failures {
            warn!("round failed ({}), giving up after {} attempts", error, failures);
            let error = OrchestratorError::FailureBudgetExhausted(failures);
            state.phase = Phase::Failed;
            state.round_state.training_active = false;
            state.round_state.status = TrainingStatus::Failed;
            state.error = Some(error.user_message());
            self.publish(&state);
            error
        } else {
            warn!("round failed ({}), attempt {}/{}", error, failures, max_failures);
            state.phase = Phase::Polling;
            state.error = Some(error.user_message());
            self.publish(&state);
            error
        }
    }

    /// Polls until the state reflects the round after `previous_round`.
    async fn reconcile(&self, session: &SessionId, previous_round: u32) -> bool {
        let outcome = retry(self.settings.reconcile, move |attempt| async move {
            match self.poll_session(session).await {
                Ok((state, _)) if state.current_round > previous_round => Ok(()),
                Ok((state, _)) if state.status.is_terminal() => Ok(()),
                Ok(_) => Err(None),
                Err(e) => Err(Some((attempt, e))),
            }
        })
        .await;
        match outcome {
            Ok(()) => true,
            Err(exhausted) => {
                warn!(
                    "the state did not reflect the round after {} polls: {:?}",
                    exhausted.attempts, exhausted.last
                );
                false
            }
        }
    }

    /// Fetches the training state and the metrics and replaces the
    /// local view with them.
    ///
    /// A poll of a session the configuration was not submitted for yet
    /// leaves the local view untouched as well.
    ///
    /// # Errors
    /// Both fetches must succeed. If either fails, the local view is
    /// left untouched.
    pub async fn poll_state(&self) -> Result<(RoundState, MetricsHistory), OrchestratorError> {
        let session = self
            .session_id()
            .await
            .ok_or(OrchestratorError::Session(SessionError::Missing))?;
        self.poll_session(&session).await
    }

    async fn poll_session(
        &self,
        session: &SessionId,
    ) -> Result<(RoundState, MetricsHistory), OrchestratorError> {
        let (fetched, metrics) = tokio::join!(
            self.client.current_state(session),
            self.client.metrics(session)
        );
        match (fetched, metrics) {
            (Ok(fetched), Ok(metrics)) => Ok(self
                .apply(session, &fetched, metrics.training_history.training_metrics.into())
                .await),
            (Err(ClientError::SessionInvalid), _) | (_, Err(ClientError::SessionInvalid)) => {
                warn!("the service rejected the session while polling, renewing it");
                self.acquire_session(true).await?;
                Err(SessionError::Invalid.into())
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!("failed to poll the training state: {}", e);
                let e = OrchestratorError::from(e);
                let mut state = self.state.lock().await;
                state.error = Some(e.user_message());
                self.publish(&state);
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        session: &SessionId,
        fetched: &CurrentStateResponse,
        metrics: MetricsHistory,
    ) -> (RoundState, MetricsHistory) {
        let mut state = self.state.lock().await;
        if state.session.as_ref() != Some(session) {
            debug!("discarding a poll of the replaced session {}", session);
            return (state.round_state.clone(), state.metrics.clone());
        }
        // a renewed session knows nothing of the training until the
        // configuration is resubmitted
        if state.initialized_for.as_ref() != Some(session) {
            debug!("discarding a poll of the uninitialized session {}", session);
            return (state.round_state.clone(), state.metrics.clone());
        }

        state.round_state = state.round_state.reconcile(fetched);
        state.metrics = metrics;
        state.error = None;
        if fetched.is_finished() && !state.phase.is_terminal() {
            info!(
                "training complete after {}/{} rounds",
                state.round_state.current_round, state.round_state.total_rounds
            );
            state.phase = Phase::Complete;
        }
        self.publish(&state);
        (state.round_state.clone(), state.metrics.clone())
    }

    /// Discards the training on the service and locally. The session is kept.
    pub async fn reset(&self) -> Result<(), OrchestratorError> {
        if let Some(session) = self.session_id().await {
            match self.client.reset(&session).await {
                Ok(_) | Err(ClientError::SessionInvalid) => {}
                Err(e) => {
                    let e = OrchestratorError::from(e);
                    let mut state = self.state.lock().await;
                    state.error = Some(e.user_message());
                    self.publish(&state);
                    return Err(e);
                }
            }
        }

        let mut state = self.state.lock().await;
        *state = State {
            session: state.session.take(),
            ..State::default()
        };
        self.failures.store(0, Ordering::Release);
        self.round_in_flight.store(false, Ordering::Release);
        info!("training reset");
        self.publish(&state);
        Ok(())
    }

    async fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock().await;
        if !state.phase.is_terminal() {
            state.phase = phase;
            self.events.broadcast_phase(phase);
        }
    }

    fn publish(&self, state: &State) {
        self.events.broadcast_phase(state.phase);
        self.events.broadcast_round_state(state.round_state.clone());
        self.events.broadcast_metrics(state.metrics.clone());
        self.events.broadcast_error(state.error.clone());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use async_trait::async_trait;

    use flboard_core::api::{
        MetricsResponse,
        StatusResponse,
        TrainRoundResponse,
        TrainingHistory,
    };

    use super::*;

    #[derive(Default)]
    pub(crate) struct Inner {
        pub sessions: AtomicU32,
        pub valid: AtomicBool,
        pub fail_new_session: AtomicBool,
        pub initialize_calls: AtomicU32,
        pub train_calls: AtomicU32,
        pub reset_calls: AtomicU32,
        pub train_delay: StdMutex<Option<Duration>>,
        pub train_errors: StdMutex<VecDeque<ClientError>>,
        pub round: AtomicU32,
        pub total_rounds: AtomicU32,
        pub state_override: StdMutex<Option<CurrentStateResponse>>,
        pub metrics_error: StdMutex<Option<ClientError>>,
        pub state_error: StdMutex<Option<ClientError>>,
    }

    /// An in-memory training service that runs rounds instantly.
    #[derive(Clone)]
    pub(crate) struct FakeService(pub Arc<Inner>);

    impl FakeService {
        pub fn new() -> Self {
            let inner = Inner::default();
            inner.valid.store(true, Ordering::SeqCst);
            inner.total_rounds.store(10, Ordering::SeqCst);
            Self(Arc::new(inner))
        }

        fn count(counter: &AtomicU32) -> u32 {
            counter.load(Ordering::SeqCst)
        }

        pub fn sessions(&self) -> u32 {
            Self::count(&self.0.sessions)
        }

        pub fn initialize_calls(&self) -> u32 {
            Self::count(&self.0.initialize_calls)
        }

        pub fn train_calls(&self) -> u32 {
            Self::count(&self.0.train_calls)
        }

        pub fn fail_next_rounds(&self, error: ClientError, n: usize) {
            let mut errors = self.0.train_errors.lock().unwrap();
            errors.extend(std::iter::repeat(error).take(n));
        }

        pub fn set_state(&self, current_round: u32, total_rounds: u32, training_active: bool) {
            *self.0.state_override.lock().unwrap() =
                Some(state(current_round, total_rounds, training_active));
        }
    }

    fn state(current_round: u32, total_rounds: u32, training_active: bool) -> CurrentStateResponse {
        CurrentStateResponse {
            status: "success".to_string(),
            current_round,
            total_rounds,
            privacy_settings: None,
            training_active,
            latest_accuracy: Some(0.5),
        }
    }

    fn ok() -> StatusResponse {
        StatusResponse {
            status: "success".to_string(),
            ..StatusResponse::default()
        }
    }

    #[async_trait]
    impl TrainingClient for FakeService {
        async fn new_session(&self) -> Result<SessionId, ClientError> {
            if self.0.fail_new_session.load(Ordering::SeqCst) {
                return Err(ClientError::Http("connection refused".to_string()));
            }
            let n = self.0.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.valid.store(true, Ordering::SeqCst);
            Ok(SessionId::new(format!("session-{}", n)))
        }

        async fn session_status(&self, _session: &SessionId) -> Result<bool, ClientError> {
            Ok(self.0.valid.load(Ordering::SeqCst))
        }

        async fn initialize(
            &self,
            _session: &SessionId,
            _config: &TrainingConfiguration,
        ) -> Result<StatusResponse, ClientError> {
            self.0.initialize_calls.fetch_add(1, Ordering::SeqCst);
            self.0.round.store(0, Ordering::SeqCst);
            Ok(ok())
        }

        async fn train_round(&self, _session: &SessionId) -> Result<TrainRoundResponse, ClientError> {
            self.0.train_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.0.train_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let error = self.0.train_errors.lock().unwrap().pop_front();
            if let Some(error) = error {
                return Err(error);
            }
            self.0.round.fetch_add(1, Ordering::SeqCst);
            Ok(TrainRoundResponse {
                status: "success".to_string(),
                metrics: serde_json::json!({}),
            })
        }

        async fn current_state(
            &self,
            _session: &SessionId,
        ) -> Result<CurrentStateResponse, ClientError> {
            if let Some(error) = self.0.state_error.lock().unwrap().clone() {
                return Err(error);
            }
            if let Some(state) = self.0.state_override.lock().unwrap().clone() {
                return Ok(state);
            }
            let round = self.0.round.load(Ordering::SeqCst);
            let total = self.0.total_rounds.load(Ordering::SeqCst);
            Ok(state(round, total, round < total))
        }

        async fn metrics(&self, _session: &SessionId) -> Result<MetricsResponse, ClientError> {
            if let Some(error) = self.0.metrics_error.lock().unwrap().clone() {
                return Err(error);
            }
            let rounds: Vec<u32> = (1..=self.0.round.load(Ordering::SeqCst)).collect();
            let training_metrics = rounds
                .iter()
                .map(|round| {
                    serde_json::from_value(serde_json::json!({ "round_number": round })).unwrap()
                })
                .collect();
            Ok(MetricsResponse {
                status: "success".to_string(),
                training_history: TrainingHistory {
                    rounds,
                    training_metrics,
                },
            })
        }

        async fn reset(&self, _session: &SessionId) -> Result<StatusResponse, ClientError> {
            self.0.reset_calls.fetch_add(1, Ordering::SeqCst);
            self.0.round.store(0, Ordering::SeqCst);
            Ok(ok())
        }
    }

    pub(crate) fn config() -> TrainingConfiguration {
        TrainingConfiguration {
            num_clients: 3,
            local_epochs: 1,
            batch_size: 32,
            noise_multiplier: 1.0,
            l2_norm_clip: 1.0,
        }
    }

    fn orchestrator(service: &FakeService) -> Orchestrator<FakeService> {
        Orchestrator::new(service.clone(), OrchestratorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_then_one_round() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        let mut phases = orchestrator.subscribe().phase_listener();

        orchestrator.initialize_training(config()).await.unwrap();
        assert_eq!(phases.changed().await, Some(Phase::Training));
        assert_eq!(service.initialize_calls(), 1);

        let outcome = orchestrator.execute_round().await.unwrap();
        assert_eq!(outcome, RoundOutcome::Dispatched { reconciled: true });
        assert_eq!(service.train_calls(), 1);

        let state = orchestrator.round_state().await;
        assert_eq!(state.current_round, 1);
        assert_eq!(state.total_rounds, 10);
        assert!(state.training_active);
        assert_eq!(state.status, TrainingStatus::Training);
        assert_eq!(orchestrator.phase().await, Phase::Polling);
        assert_eq!(orchestrator.metrics().await.len(), 1);
        assert_eq!(orchestrator.error().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rounds_dispatch_once() {
        let service = FakeService::new();
        *service.0.train_delay.lock().unwrap() = Some(Duration::from_secs(1));
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();

        let (first, second) = tokio::join!(orchestrator.execute_round(), orchestrator.execute_round());
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|outcome| matches!(outcome, RoundOutcome::Skipped(_)));
        assert_eq!(
            outcomes,
            vec![
                RoundOutcome::Dispatched { reconciled: true },
                RoundOutcome::Skipped(SkipReason::InFlight)
            ]
        );
        assert_eq!(service.train_calls(), 1);

        // the flag is released afterwards
        orchestrator.execute_round().await.unwrap();
        assert_eq!(service.train_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_budget() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        service.fail_next_rounds(
            ClientError::Service {
                status: 500,
                message: "Internal Server Error".to_string(),
            },
            10,
        );

        for _ in 0..2 {
            let err = orchestrator.execute_round().await.unwrap_err();
            assert_eq!(err.user_message(), "Internal Server Error");
            assert!(!orchestrator.is_terminal().await);
        }
        let err = orchestrator.execute_round().await.unwrap_err();
        assert_eq!(err, OrchestratorError::FailureBudgetExhausted(3));
        assert_eq!(orchestrator.phase().await, Phase::Failed);
        assert_eq!(
            orchestrator.error().await.unwrap(),
            "Training failed after 3 attempts. Please try again."
        );
        let state = orchestrator.round_state().await;
        assert!(!state.training_active);
        assert_eq!(state.status, TrainingStatus::Failed);

        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Skipped(SkipReason::Terminal)
        );
        assert_eq!(service.train_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();

        service.fail_next_rounds(ClientError::Timeout, 2);
        assert_eq!(
            orchestrator.execute_round().await.unwrap_err(),
            OrchestratorError::Timeout
        );
        orchestrator.execute_round().await.unwrap_err();
        orchestrator.execute_round().await.unwrap();

        service.fail_next_rounds(ClientError::Timeout, 2);
        orchestrator.execute_round().await.unwrap_err();
        orchestrator.execute_round().await.unwrap_err();
        assert!(!orchestrator.is_terminal().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_poll_failure_keeps_state() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        orchestrator.execute_round().await.unwrap();
        let state = orchestrator.round_state().await;
        let metrics = orchestrator.metrics().await;

        service.0.round.store(5, Ordering::SeqCst);
        *service.0.metrics_error.lock().unwrap() = Some(ClientError::Timeout);
        assert!(orchestrator.poll_state().await.is_err());
        assert_eq!(orchestrator.round_state().await, state);
        assert_eq!(orchestrator.metrics().await, metrics);
        assert_eq!(orchestrator.error().await.unwrap(), "Request timed out");

        *service.0.metrics_error.lock().unwrap() = None;
        *service.0.state_error.lock().unwrap() = Some(ClientError::Http("reset".to_string()));
        assert!(orchestrator.poll_state().await.is_err());
        assert_eq!(orchestrator.round_state().await, state);

        *service.0.state_error.lock().unwrap() = None;
        let (state, metrics) = orchestrator.poll_state().await.unwrap();
        assert_eq!(state.current_round, 5);
        assert_eq!(metrics.len(), 5);
        assert_eq!(orchestrator.error().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_counter_never_goes_back() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        service.set_state(4, 10, true);
        orchestrator.poll_state().await.unwrap();
        service.set_state(2, 10, true);
        let (state, _) = orchestrator.poll_state().await.unwrap();
        assert_eq!(state.current_round, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_setup_is_never_submitted() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        let setup = ClientSetup::from_data_sizes(&[2000, 2000, 2000, 100]).unwrap();
        let err = orchestrator
            .initialize_from_setup(&setup, TrainingConfiguration::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::DataSizeCap { total: 6100, .. })
        ));
        assert_eq!(service.initialize_calls(), 0);
        assert_eq!(service.sessions(), 0);
        assert_eq!(orchestrator.phase().await, Phase::Idle);
        assert_eq!(
            orchestrator.error().await.unwrap(),
            "Total data size too large. Please reduce the number of samples or clients."
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_once_per_session() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        let mut config = config();
        config.batch_size = 0;
        assert!(orchestrator.initialize_training(config).await.is_err());
        assert_eq!(service.initialize_calls(), 0);

        orchestrator.initialize_training(self::config()).await.unwrap();
        assert_eq!(
            orchestrator.initialize_training(self::config()).await,
            Err(OrchestratorError::AlreadyInitialized)
        );
        assert_eq!(service.initialize_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_state_stops_rounds() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        service.set_state(10, 10, false);
        let (state, _) = orchestrator.poll_state().await.unwrap();
        assert_eq!(state.status, TrainingStatus::Complete);
        assert_eq!(orchestrator.phase().await, Phase::Complete);
        assert_eq!(state.status_line(None), "Training Complete!");
        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Skipped(SkipReason::Terminal)
        );
        assert_eq!(service.train_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_session_is_renewed() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        let first = orchestrator.acquire_session(false).await.unwrap();
        assert_eq!(orchestrator.acquire_session(false).await.unwrap(), first);
        assert_eq!(orchestrator.acquire_session(true).await.unwrap(), first);
        assert_eq!(service.sessions(), 1);

        service.0.valid.store(false, Ordering::SeqCst);
        let second = orchestrator.acquire_session(true).await.unwrap();
        assert_ne!(second, first);
        assert_eq!(service.sessions(), 2);
        assert_ne!(orchestrator.phase().await, Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_replaced() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        let first = orchestrator.acquire_session(false).await.unwrap();
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_ne!(orchestrator.acquire_session(false).await.unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_round_renews_and_resubmits() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();

        service.0.valid.store(false, Ordering::SeqCst);
        service.fail_next_rounds(ClientError::SessionInvalid, 1);
        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::SessionRenewed
        );
        assert_eq!(service.sessions(), 2);
        assert_eq!(orchestrator.error().await, None);

        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Dispatched { reconciled: true }
        );
        assert_eq!(service.initialize_calls(), 2);
        assert_eq!(orchestrator.round_state().await.current_round, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_marks_training_failed() {
        let service = FakeService::new();
        service.0.fail_new_session.store(true, Ordering::SeqCst);
        let orchestrator = orchestrator(&service);
        let err = orchestrator.initialize_training(config()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Session(SessionError::Unreachable(_))
        ));
        assert_eq!(orchestrator.phase().await, Phase::Failed);
        let state = orchestrator.round_state().await;
        assert!(!state.training_active);
        assert_eq!(state.status, TrainingStatus::Failed);
        assert_eq!(
            orchestrator.error().await.unwrap(),
            "Failed to initialize session"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        orchestrator.execute_round().await.unwrap();
        let session = orchestrator.session_id().await;

        orchestrator.reset().await.unwrap();
        assert_eq!(service.0.reset_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.phase().await, Phase::Idle);
        assert_eq!(orchestrator.round_state().await, RoundState::default());
        assert!(orchestrator.metrics().await.is_empty());
        assert_eq!(orchestrator.session_id().await, session);
        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Skipped(SkipReason::NotInitialized)
        );

        orchestrator.initialize_training(config()).await.unwrap();
        assert_eq!(service.initialize_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_session_is_not_polled_until_resubmitted() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        orchestrator.execute_round().await.unwrap();

        service.0.valid.store(false, Ordering::SeqCst);
        orchestrator.acquire_session(true).await.unwrap();
        assert_eq!(service.sessions(), 2);

        // the new session has no training yet
        service.set_state(0, 10, false);
        let (state, _) = orchestrator.poll_state().await.unwrap();
        assert_ne!(state.status, TrainingStatus::Complete);
        assert_ne!(orchestrator.phase().await, Phase::Complete);
        assert!(!orchestrator.is_terminal().await);

        *service.0.state_override.lock().unwrap() = None;
        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Dispatched { reconciled: true }
        );
        assert_eq!(service.initialize_calls(), 2);
        assert_eq!(service.train_calls(), 2);
        assert_eq!(orchestrator.round_state().await.current_round, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninitialized_session_is_not_completed() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.acquire_session(false).await.unwrap();
        service.set_state(0, 10, false);
        orchestrator.poll_state().await.unwrap();
        assert_eq!(orchestrator.phase().await, Phase::Idle);
        assert_eq!(orchestrator.round_state().await, RoundState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_without_reconciliation() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        orchestrator.execute_round().await.unwrap();
        let state = orchestrator.round_state().await;
        let metrics = orchestrator.metrics().await;

        *service.0.metrics_error.lock().unwrap() = Some(ClientError::Timeout);
        let start = Instant::now();
        assert_eq!(
            orchestrator.execute_round().await.unwrap(),
            RoundOutcome::Dispatched { reconciled: false }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(service.train_calls(), 2);
        assert_eq!(orchestrator.round_state().await, state);
        assert_eq!(orchestrator.metrics().await, metrics);
        assert_eq!(orchestrator.phase().await, Phase::Polling);
        assert_eq!(orchestrator.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_poll_renews_session() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        orchestrator.initialize_training(config()).await.unwrap();
        let first = orchestrator.session_id().await;

        service.0.valid.store(false, Ordering::SeqCst);
        *service.0.state_error.lock().unwrap() = Some(ClientError::SessionInvalid);
        assert_eq!(
            orchestrator.poll_state().await,
            Err(OrchestratorError::Session(SessionError::Invalid))
        );
        assert_eq!(service.sessions(), 2);
        assert_ne!(orchestrator.session_id().await, first);
        assert_eq!(orchestrator.failures.load(Ordering::SeqCst), 0);
        assert!(!orchestrator.is_terminal().await);

        *service.0.state_error.lock().unwrap() = None;
        *service.0.metrics_error.lock().unwrap() = Some(ClientError::SessionInvalid);
        service.0.valid.store(false, Ordering::SeqCst);
        assert!(orchestrator.poll_state().await.is_err());
        assert_eq!(service.sessions(), 3);
        assert_eq!(orchestrator.failures.load(Ordering::SeqCst), 0);
        assert!(!orchestrator.is_terminal().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_renewal() {
        let service = FakeService::new();
        let orchestrator = orchestrator(&service);
        assert!(!orchestrator.needs_renewal().await);
        orchestrator.acquire_session(false).await.unwrap();
        assert!(!orchestrator.needs_renewal().await);
        tokio::time::advance(Duration::from_secs(25 * 60)).await;
        assert!(orchestrator.needs_renewal().await);
        orchestrator.acquire_session(true).await.unwrap();
        assert!(!orchestrator.needs_renewal().await);
    }
}
