use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use flboard_core::{
    api::{
        error_message,
        session_status_path,
        CurrentStateResponse,
        MetricsResponse,
        NewSessionResponse,
        SessionStatusResponse,
        StatusResponse,
        TrainRoundResponse,
        CURRENT_STATE_PATH,
        INITIALIZE_PATH,
        METRICS_PATH,
        NEW_SESSION_PATH,
        RESET_PATH,
        TRAIN_ROUND_PATH,
    },
    SessionId,
    TrainingConfiguration,
};

use crate::TrainingClient;

/// The default bound on the duration of a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error returned by the requests of a [`Client`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("the session is not valid")]
    SessionInvalid,

    /// The service answered with a non-success status. The message is
    /// the `error` field of the response or its raw text.
    #[error("{message}")]
    Service { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to serialize data: {0}")]
    Serialize(String),

    #[error("failed to deserialize data: {0}")]
    Deserialize(String),

    #[error("the service did not provide a session id")]
    NoSessionId,
}

impl ClientError {
    pub fn http_error<E: std::error::Error>(e: E) -> Self {
        Self::Http(format!("{}", e))
    }
}

/// A response as received from the network.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// A response with a JSON body.
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A basic HTTP interface that [`Client`] HTTP backends must implement.
///
/// A backend returns every response it receives, whatever its status:
/// interpreting the status is up to the caller. Only transport failures
/// are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Perform an HTTP `GET` on the given URL, carrying the session header if any.
    async fn get(&self, url: String, session: Option<SessionId>)
        -> Result<HttpResponse, ClientError>;

    /// Perform an HTTP `POST` on the given URL, with the given JSON body if any.
    async fn post(
        &self,
        url: String,
        session: Option<SessionId>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, ClientError>;
}

/// Error returned when trying to create a [`Client`] with an invalid
/// address for the training service.
#[derive(Debug, Error)]
#[error("Invalid base URL: {}", .0)]
pub struct InvalidBaseUrl(String);

/// Checks that `base_url` can serve as the address of the training service.
pub fn parse_base_url(base_url: &str) -> Result<Url, InvalidBaseUrl> {
    let url = Url::parse(base_url).map_err(|e| InvalidBaseUrl(format!("{}", e)))?;
    if url.cannot_be_a_base() {
        return Err(InvalidBaseUrl(String::from("cannot be a base URL")));
    }
    Ok(url)
}

/// Joins an absolute API path to a base URL, keeping the base's own path.
pub fn join_url(base_url: &Url, path: &str) -> String {
    format!("{}{}", base_url.as_str().trim_end_matches('/'), path)
}

#[derive(Debug, Clone)]
/// A client that communicates with the training service via HTTP(S).
pub struct Client<C> {
    /// HTTP(S) client
    client: C,
    /// Training service URL
    base_url: Url,
    /// Bound on the duration of each request
    timeout: Duration,
}

impl<C> Client<C>
where
    C: HttpClient,
{
    /// Create a new client.
    ///
    /// # Args
    ///
    /// - `client` is the HTTP client that will be used to perform the HTTP requests. Any HTTP
    ///   client can be used, as long as it implements the [`HttpClient`] trait.
    /// - `base_url` is the URL of the training service
    ///
    /// # Errors
    ///
    /// An error is returned if `base_url` is not a valid URL
    pub fn new(http_client: C, base_url: &str) -> Result<Self, InvalidBaseUrl> {
        Ok(Self {
            client: http_client,
            base_url: parse_base_url(base_url)?,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound every request to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn bounded<F>(&self, request: F) -> Result<HttpResponse, ClientError>
    where
        F: Future<Output = Result<HttpResponse, ClientError>>,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn get<T>(&self, path: &str, session: Option<&SessionId>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.bounded(self.client.get(url, session.cloned())).await?;
        decode(response)
    }

    async fn post<T>(
        &self,
        path: &str,
        session: Option<&SessionId>,
        body: Option<Vec<u8>>,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self
            .bounded(self.client.post(url, session.cloned(), body))
            .await?;
        decode(response)
    }
}

fn decode<T>(response: HttpResponse) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    match response.status {
        200..=299 => serde_json::from_slice(&response.body)
            .map_err(|e| ClientError::Deserialize(format!("{}", e))),
        401 => Err(ClientError::SessionInvalid),
        status => {
            let mut message = error_message(&response.body);
            if message.is_empty() {
                message = format!("request failed with status {}", status);
            }
            Err(ClientError::Service { status, message })
        }
    }
}

#[async_trait]
impl<C> TrainingClient for Client<C>
where
    C: HttpClient,
{
    async fn new_session(&self) -> Result<SessionId, ClientError> {
        let response: NewSessionResponse = self.post(NEW_SESSION_PATH, None, None).await?;
        response
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or(ClientError::NoSessionId)
    }

    async fn session_status(&self, session: &SessionId) -> Result<bool, ClientError> {
        let response: SessionStatusResponse =
            self.get(&session_status_path(session), None).await?;
        Ok(response.valid)
    }

    async fn initialize(
        &self,
        session: &SessionId,
        config: &TrainingConfiguration,
    ) -> Result<StatusResponse, ClientError> {
        let body =
            serde_json::to_vec(config).map_err(|e| ClientError::Serialize(format!("{}", e)))?;
        self.post(INITIALIZE_PATH, Some(session), Some(body)).await
    }

    async fn train_round(&self, session: &SessionId) -> Result<TrainRoundResponse, ClientError> {
        self.post(TRAIN_ROUND_PATH, Some(session), None).await
    }

    async fn current_state(
        &self,
        session: &SessionId,
    ) -> Result<CurrentStateResponse, ClientError> {
        self.get(CURRENT_STATE_PATH, Some(session)).await
    }

    async fn metrics(&self, session: &SessionId) -> Result<MetricsResponse, ClientError> {
        self.get(METRICS_PATH, Some(session)).await
    }

    async fn reset(&self, session: &SessionId) -> Result<StatusResponse, ClientError> {
        self.post(RESET_PATH, Some(session), None).await
    }
}

#[cfg(feature = "reqwest-client")]
mod reqwest_client {
    use async_trait::async_trait;
    use reqwest::header::CONTENT_TYPE;

    use flboard_core::{api::SESSION_HEADER, SessionId};

    use super::{ClientError, HttpClient, HttpResponse};

    async fn send(request: reqwest::RequestBuilder) -> Result<HttpResponse, ClientError> {
        let response = request.send().await.map_err(ClientError::http_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(ClientError::http_error)?;
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn get(
            &self,
            url: String,
            session: Option<SessionId>,
        ) -> Result<HttpResponse, ClientError> {
            let mut request = reqwest::Client::get(self, &url);
            if let Some(session) = session {
                request = request.header(SESSION_HEADER, session.as_str());
            }
            send(request).await
        }

        async fn post(
            &self,
            url: String,
            session: Option<SessionId>,
            body: Option<Vec<u8>>,
        ) -> Result<HttpResponse, ClientError> {
            let mut request =
                reqwest::Client::post(self, &url).header(CONTENT_TYPE, "application/json");
            if let Some(session) = session {
                request = request.header(SESSION_HEADER, session.as_str());
            }
            if let Some(body) = body {
                request = request.body(body);
            }
            send(request).await
        }
    }
}
