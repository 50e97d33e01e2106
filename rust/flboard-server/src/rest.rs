//! A HTTP proxy in front of the training service.
//!
//! Every route forwards its request to the identically named endpoint of
//! the training service and relays the response, status and body, as is.
//! The `/api/fl` routes require the session header.

use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tracing::{error, warn};
use url::Url;
use warp::{
    http::{header::CONTENT_TYPE, StatusCode},
    reply::{self, Reply, Response},
    Filter,
    Rejection,
};

use flboard_core::{
    api::{
        session_status_path,
        ErrorBody,
        CURRENT_STATE_PATH,
        INITIALIZE_PATH,
        METRICS_PATH,
        NEW_SESSION_PATH,
        RESET_PATH,
        SESSION_HEADER,
        TRAIN_ROUND_PATH,
    },
    SessionId,
};
use flboard_sdk::client::{join_url, parse_base_url, ClientError, HttpClient, HttpResponse};

use crate::settings::{ApiSettings, BackendSettings};

/// Forwards requests to the training service.
pub struct Proxy<C> {
    client: Arc<C>,
    backend: Url,
    timeout: Duration,
    metrics_timeout: Duration,
}

impl<C> Clone for Proxy<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            backend: self.backend.clone(),
            timeout: self.timeout,
            metrics_timeout: self.metrics_timeout,
        }
    }
}

impl<C> Proxy<C>
where
    C: HttpClient,
{
    /// Creates a proxy for the training service of the given settings.
    ///
    /// # Errors
    /// Fails if the URL of the training service is invalid.
    pub fn new(client: C, settings: &BackendSettings) -> Result<Self, RestError> {
        let backend = parse_base_url(&settings.url)
            .map_err(|e| RestError::InvalidBackendUrl(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            backend,
            timeout: settings.timeout(),
            metrics_timeout: settings.metrics_timeout(),
        })
    }

    async fn get(&self, path: &str, session: Option<SessionId>, timeout: Duration) -> Response {
        let url = join_url(&self.backend, path);
        relay(timeout, self.client.get(url, session)).await
    }

    async fn post(
        &self,
        path: &str,
        session: Option<SessionId>,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> Response {
        let url = join_url(&self.backend, path);
        let body = body.map(|body| body.to_vec());
        relay(timeout, self.client.post(url, session, body)).await
    }
}

/// Starts the proxy at the configured address.
pub async fn serve<C>(api_settings: ApiSettings, proxy: Proxy<C>)
where
    C: HttpClient,
{
    warp::serve(routes(proxy))
        .run(api_settings.bind_address)
        .await;
}

/// The filter of all the proxy routes.
pub fn routes<C>(proxy: Proxy<C>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone
where
    C: HttpClient,
{
    let new_session = warp::path!("api" / "session" / "new")
        .and(warp::post())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_new_session);

    let session_status = warp::path!("api" / "session" / String / "status")
        .and(warp::get())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_session_status);

    let initialize = warp::path!("api" / "fl" / "initialize")
        .and(warp::post())
        .and(with_session())
        .and(warp::body::bytes())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_initialize);

    let train_round = warp::path!("api" / "fl" / "train_round")
        .and(warp::post())
        .and(with_session())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_train_round);

    let current_state = warp::path!("api" / "fl" / "current_state")
        .and(warp::get())
        .and(with_session())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_current_state);

    let metrics = warp::path!("api" / "fl" / "metrics")
        .and(warp::get())
        .and(with_session())
        .and(with_proxy(proxy.clone()))
        .and_then(handle_metrics);

    let reset = warp::path!("api" / "fl" / "reset")
        .and(warp::post())
        .and(with_session())
        .and(with_proxy(proxy))
        .and_then(handle_reset);

    new_session
        .or(session_status)
        .or(initialize)
        .or(train_round)
        .or(current_state)
        .or(metrics)
        .or(reset)
        .recover(handle_reject)
        .with(warp::log("http"))
}

async fn handle_new_session<C: HttpClient>(proxy: Proxy<C>) -> Result<Response, Infallible> {
    Ok(proxy.post(NEW_SESSION_PATH, None, None, proxy.timeout).await)
}

async fn handle_session_status<C: HttpClient>(
    id: String,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    let path = session_status_path(&SessionId::from(id));
    Ok(proxy.get(&path, None, proxy.timeout).await)
}

async fn handle_initialize<C: HttpClient>(
    session: SessionId,
    body: Bytes,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    Ok(proxy
        .post(INITIALIZE_PATH, Some(session), Some(body), proxy.timeout)
        .await)
}

async fn handle_train_round<C: HttpClient>(
    session: SessionId,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    Ok(proxy
        .post(TRAIN_ROUND_PATH, Some(session), None, proxy.timeout)
        .await)
}

async fn handle_current_state<C: HttpClient>(
    session: SessionId,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    Ok(proxy
        .get(CURRENT_STATE_PATH, Some(session), proxy.timeout)
        .await)
}

async fn handle_metrics<C: HttpClient>(
    session: SessionId,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    Ok(proxy
        .get(METRICS_PATH, Some(session), proxy.metrics_timeout)
        .await)
}

async fn handle_reset<C: HttpClient>(
    session: SessionId,
    proxy: Proxy<C>,
) -> Result<Response, Infallible> {
    Ok(proxy
        .post(RESET_PATH, Some(session), None, proxy.timeout)
        .await)
}

/// Awaits a forwarded request and turns its outcome into the reply.
async fn relay<F>(timeout: Duration, request: F) -> Response
where
    F: Future<Output = Result<HttpResponse, ClientError>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(response)) => upstream_reply(response),
        Ok(Err(e)) => {
            warn!("failed to forward the request: {}", e);
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(_) => {
            warn!("the training service did not answer within {:?}", timeout);
            error_reply(StatusCode::GATEWAY_TIMEOUT, ClientError::Timeout.to_string())
        }
    }
}

fn upstream_reply(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    reply::with_status(
        reply::with_header(response.body.to_vec(), CONTENT_TYPE, content_type),
        status,
    )
    .into_response()
}

fn error_reply(status: StatusCode, error: String) -> Response {
    reply::with_status(reply::json(&ErrorBody::new(error)), status).into_response()
}

/// Converts a proxy into a `warp` filter.
fn with_proxy<C: HttpClient>(
    proxy: Proxy<C>,
) -> impl Filter<Extract = (Proxy<C>,), Error = Infallible> + Clone {
    warp::any().map(move || proxy.clone())
}

/// Extracts the session from the session header.
fn with_session() -> impl Filter<Extract = (SessionId,), Error = Rejection> + Clone {
    warp::header::optional::<String>(SESSION_HEADER).and_then(|session: Option<String>| async move {
        match session.map(SessionId::from) {
            Some(session) if !session.is_empty() => Ok(session),
            _ => Err(warp::reject::custom(MissingSession)),
        }
    })
}

#[derive(Debug)]
struct MissingSession;

impl warp::reject::Reject for MissingSession {}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: Rejection) -> Result<Response, Infallible> {
    if err.find::<MissingSession>().is_some() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "No session ID provided".to_string(),
        ));
    }
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(reply::with_status(Vec::new(), code).into_response())
}

#[derive(Debug, Error)]
/// Errors of the proxy.
pub enum RestError {
    #[error("invalid backend URL: {0}")]
    InvalidBackendUrl(String),
}
