use std::{convert::Infallible, sync::Arc};

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, FromRequest, FromRequestParts, Query, Request, State,
        rejection::QueryRejection,
    },
    http::{
        Extensions, HeaderMap, HeaderValue, Method, StatusCode, Uri, header, request::Parts,
        uri::PathAndQuery,
    },
    response::{IntoResponse, Response},
    routing::post,
};
use serde::de::DeserializeOwned;
use tower::{Layer, limit::GlobalConcurrencyLimitLayer, util::MapRequestLayer};
use tower_http::{
    cors::CorsLayer,
    normalize_path::NormalizePathLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    adapters,
    clients::queue::TaskQueue,
    config::ServerConfig,
    error::RequestError,
    models::{
        message::{MessageTask, TASK_KIND},
        request::{GrafanaQuery, GrafanaRequest, MessageRequest},
        response::Envelope,
        task::{Task, TaskInfo},
    },
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const SERVER_NAME: &str = "overpush";

#[derive(Clone)]
pub struct AppState {
    queue: Arc<dyn TaskQueue>,
}

impl AppState {
    async fn submit(&self, request_id: &str, task: &MessageTask) -> Result<TaskInfo, RequestError> {
        let payload = task.encode()?;

        debug!(
            request_id,
            payload = %String::from_utf8_lossy(&payload),
            "Enqueueing request"
        );

        let info = self.queue.enqueue(Task::new(TASK_KIND, payload)).await?;

        info!(request_id, task_id = %info.id, queue = %info.queue, "Message enqueued");

        Ok(info)
    }
}

/// Builds the gateway routes with the full middleware stack. Both serve
/// modes drive this same router.
///
/// Paths match case-insensitively and ignore a trailing slash.
pub fn router(queue: Arc<dyn TaskQueue>, server: ServerConfig) -> Router {
    let state = AppState { queue };

    let routes = Router::new()
        .route(
            "/1/messages.json",
            post(submit_message).fallback(method_not_allowed),
        )
        .route("/grafana", post(submit_grafana).fallback(method_not_allowed))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(server.body_limit))
        .layer(GlobalConcurrencyLimitLayer::new(server.concurrency))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // routing happens inside `routes`, so the path is rewritten before it
    let normalized = MapRequestLayer::new(lowercase_path)
        .layer(NormalizePathLayer::trim_trailing_slash().layer(routes));

    Router::new().fallback_service(normalized)
}

/// Lowercases the path only; query values such as credentials keep their case.
fn lowercase_path(mut request: Request) -> Request {
    let uri = request.uri();
    if !uri.path().bytes().any(|b| b.is_ascii_uppercase()) {
        return request;
    }

    let folded = match uri.query() {
        Some(query) => format!("{}?{}", uri.path().to_ascii_lowercase(), query),
        None => uri.path().to_ascii_lowercase(),
    };

    let mut parts = uri.clone().into_parts();
    if let Ok(path_and_query) = PathAndQuery::try_from(folded) {
        parts.path_and_query = Some(path_and_query);
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
    }

    request
}

fn request_span(request: &Request) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
    )
}

/// Correlation id assigned at request entry.
pub struct CorrelationId(pub String);

fn correlation_id(headers: &HeaderMap, extensions: &Extensions) -> String {
    extensions
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .or_else(|| {
            headers
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
        })
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(correlation_id(&parts.headers, &parts.extensions)))
    }
}

/// A refused request. Rendering it always yields the envelope with the
/// request's correlation id.
#[derive(Debug)]
pub struct Rejected {
    pub request_id: String,
    pub error: RequestError,
}

impl IntoResponse for Rejected {
    fn into_response(self) -> Response {
        let Rejected { request_id, error } = self;

        match &error {
            RequestError::Enqueue(err) => {
                warn!(request_id = %request_id, error = %err, "Failed to enqueue message");
            }
            other => {
                debug!(request_id = %request_id, error = %other, "Rejected request");
            }
        }

        let envelope = Envelope::rejected(request_id, error.messages());
        (error.status_code(), Json(envelope)).into_response()
    }
}

/// Request body decoded by content type: url-encoded forms, JSON otherwise.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = Rejected;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = correlation_id(req.headers(), req.extensions());

        decode_body(req, state)
            .await
            .map(Self)
            .map_err(|error| Rejected { request_id, error })
    }
}

async fn decode_body<S, T>(req: Request, state: &S) -> Result<T, RequestError>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    if is_form(req.headers()) {
        let Form(value) = Form::<T>::from_request(req, state)
            .await
            .map_err(|e| RequestError::Malformed(e.body_text()))?;
        return Ok(value);
    }

    let bytes = Bytes::from_request(req, state)
        .await
        .map_err(|e| RequestError::Malformed(e.body_text()))?;

    serde_json::from_slice(&bytes).map_err(|e| RequestError::Malformed(e.to_string()))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

async fn submit_message(
    State(state): State<AppState>,
    CorrelationId(request_id): CorrelationId,
    Payload(request): Payload<MessageRequest>,
) -> Response {
    let result = accept_native(&state, &request_id, request).await;
    respond(request_id, result)
}

async fn accept_native(
    state: &AppState,
    request_id: &str,
    request: MessageRequest,
) -> Result<TaskInfo, RequestError> {
    let task = adapters::from_native(request)?;
    state.submit(request_id, &task).await
}

// The body is extracted first; a bad query is only reported for a parseable body.
async fn submit_grafana(
    State(state): State<AppState>,
    CorrelationId(request_id): CorrelationId,
    query: Result<Query<GrafanaQuery>, QueryRejection>,
    Payload(request): Payload<GrafanaRequest>,
) -> Response {
    let result = accept_grafana(&state, &request_id, query, request).await;
    respond(request_id, result)
}

async fn accept_grafana(
    state: &AppState,
    request_id: &str,
    query: Result<Query<GrafanaQuery>, QueryRejection>,
    request: GrafanaRequest,
) -> Result<TaskInfo, RequestError> {
    let Query(query) = query.map_err(|e| RequestError::Malformed(e.body_text()))?;
    let task = adapters::from_grafana(request, query)?;
    state.submit(request_id, &task).await
}

async fn not_found(CorrelationId(request_id): CorrelationId, method: Method, uri: Uri) -> Response {
    respond(
        request_id,
        Err(RequestError::NotFound(format!("Cannot {} {}", method, uri.path()))),
    )
}

async fn method_not_allowed(
    CorrelationId(request_id): CorrelationId,
    method: Method,
    uri: Uri,
) -> Response {
    respond(
        request_id,
        Err(RequestError::MethodNotAllowed(format!(
            "Cannot {} {}",
            method,
            uri.path()
        ))),
    )
}

/// Converts a handler outcome into the envelope. Every route ends here.
fn respond(request_id: String, result: Result<TaskInfo, RequestError>) -> Response {
    match result {
        Ok(_) => (StatusCode::OK, Json(Envelope::accepted(request_id))).into_response(),
        Err(error) => Rejected { request_id, error }.into_response(),
    }
}
