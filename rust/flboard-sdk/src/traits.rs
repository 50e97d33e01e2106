use async_trait::async_trait;

use flboard_core::{
    api::{CurrentStateResponse, MetricsResponse, StatusResponse, TrainRoundResponse},
    SessionId,
    TrainingConfiguration,
};

use crate::client::ClientError;

/// A trait used by the [`Orchestrator`] to communicate with the
/// training service.
///
/// All the methods take `&self`: an implementor is shared between the
/// scheduling loops, which may call it concurrently.
///
/// [`Orchestrator`]: crate::Orchestrator
#[async_trait]
pub trait TrainingClient: Send + Sync + 'static {
    /// Request a new session.
    async fn new_session(&self) -> Result<SessionId, ClientError>;

    /// Ask whether the given session is still valid.
    async fn session_status(&self, session: &SessionId) -> Result<bool, ClientError>;

    /// Submit the training configuration for the given session.
    async fn initialize(
        &self,
        session: &SessionId,
        config: &TrainingConfiguration,
    ) -> Result<StatusResponse, ClientError>;

    /// Run one training round.
    async fn train_round(&self, session: &SessionId) -> Result<TrainRoundResponse, ClientError>;

    /// Retrieve the current training state.
    async fn current_state(&self, session: &SessionId)
        -> Result<CurrentStateResponse, ClientError>;

    /// Retrieve the metrics of all the rounds so far.
    async fn metrics(&self, session: &SessionId) -> Result<MetricsResponse, ClientError>;

    /// Discard the training of the given session.
    async fn reset(&self, session: &SessionId) -> Result<StatusResponse, ClientError>;
}
