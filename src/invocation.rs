//! Runs single platform invocations through the gateway router.
//!
//! Events arrive as API-gateway proxy requests. The adapter rebuilds an HTTP
//! request from them, drives it through the same router the listener serves,
//! and maps the HTTP response back. It has no routing or validation of its own.

use aws_lambda_events::{
    apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse},
    encodings::Body as EventBody,
};
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use lambda_runtime::LambdaEvent;
use reqwest::Url;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::error::InvocationError;

#[derive(Clone)]
pub struct InvocationAdapter {
    router: Router,
}

impl InvocationAdapter {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub async fn handle(
        &self,
        event: ApiGatewayProxyRequest,
    ) -> Result<ApiGatewayProxyResponse, InvocationError> {
        debug!(method = %event.http_method, path = ?event.path, "Handling invocation");

        let request = into_http_request(event)?;
        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        from_http_response(response).await
    }

    /// Entry point registered with the invocation runtime.
    pub async fn handle_event(
        &self,
        event: LambdaEvent<ApiGatewayProxyRequest>,
    ) -> Result<ApiGatewayProxyResponse, lambda_runtime::Error> {
        let invocation_id = event.context.request_id.clone();

        self.handle(event.payload).await.map_err(|e| {
            warn!(invocation_id = %invocation_id, error = %e, "Invocation failed");
            e.into()
        })
    }
}

pub fn into_http_request(event: ApiGatewayProxyRequest) -> Result<Request<Body>, InvocationError> {
    let uri = path_and_query(&event)?;
    let body = decode_body(&event)?;

    let mut request = Request::builder()
        .method(event.http_method)
        .uri(uri)
        .body(body)
        .map_err(|e| InvocationError::Uri(e.to_string()))?;

    *request.headers_mut() = if event.multi_value_headers.is_empty() {
        event.headers
    } else {
        event.multi_value_headers
    };

    Ok(request)
}

fn path_and_query(event: &ApiGatewayProxyRequest) -> Result<String, InvocationError> {
    let mut url = Url::parse("http://invocation.local")
        .map_err(|e| InvocationError::Uri(e.to_string()))?;
    url.set_path(event.path.as_deref().unwrap_or("/"));

    let query = if event.multi_value_query_string_parameters.is_empty() {
        &event.query_string_parameters
    } else {
        &event.multi_value_query_string_parameters
    };

    // sorted by key so the rebuilt query is stable across invocations
    let mut params: Vec<(&str, &str)> = query.iter().collect();
    params.sort_by_key(|(key, _)| *key);

    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

fn decode_body(event: &ApiGatewayProxyRequest) -> Result<Body, InvocationError> {
    match &event.body {
        None => Ok(Body::empty()),
        Some(body) if event.is_base64_encoded => Ok(Body::from(BASE64.decode(body)?)),
        Some(body) => Ok(Body::from(body.clone())),
    }
}

pub async fn from_http_response(
    response: Response<Body>,
) -> Result<ApiGatewayProxyResponse, InvocationError> {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await?;

    let mut proxy = ApiGatewayProxyResponse::default();
    proxy.status_code = i64::from(parts.status.as_u16());
    proxy.multi_value_headers = parts.headers.clone();
    proxy.headers = parts.headers;

    if !bytes.is_empty() {
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => proxy.body = Some(EventBody::Text(text)),
            Err(e) => {
                proxy.body = Some(EventBody::Binary(e.into_bytes()));
                proxy.is_base64_encoded = true;
            }
        }
    }

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::RawQuery,
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use serde_json::{Value, json};

    use super::*;

    fn echo_router() -> Router {
        Router::new()
            .route(
                "/echo",
                post(|RawQuery(query): RawQuery, headers: HeaderMap, body: String| async move {
                    let tags: Vec<&str> = headers
                        .get_all("x-tag")
                        .iter()
                        .filter_map(|v| v.to_str().ok())
                        .collect();
                    (
                        StatusCode::CREATED,
                        [("x-tag", tags.join(","))],
                        format!("{}|{}", query.unwrap_or_default(), body),
                    )
                }),
            )
            .route("/binary", post(|| async { vec![0xffu8, 0x00, 0xfe] }))
    }

    fn event(value: Value) -> ApiGatewayProxyRequest {
        serde_json::from_value(value).unwrap()
    }

    fn text(response: &ApiGatewayProxyResponse) -> &str {
        match &response.body {
            Some(EventBody::Text(text)) => text,
            other => panic!("expected a text body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_trips_status_headers_and_body() {
        let adapter = InvocationAdapter::new(echo_router());

        let response = adapter
            .handle(event(json!({
                "httpMethod": "POST",
                "path": "/echo",
                "headers": {"X-Tag": "alpha"},
                "queryStringParameters": {"user": "u 1"},
                "body": "hello",
                "isBase64Encoded": false
            })))
            .await
            .unwrap();

        assert_eq!(response.status_code, 201);
        assert_eq!(response.headers.get("x-tag").unwrap(), "alpha");
        assert_eq!(text(&response), "user=u+1|hello");
        assert!(!response.is_base64_encoded);
    }

    #[tokio::test]
    async fn test_base64_bodies_are_decoded_and_encoded() {
        let adapter = InvocationAdapter::new(echo_router());

        let response = adapter
            .handle(event(json!({
                "httpMethod": "POST",
                "path": "/echo",
                "body": BASE64.encode("raw bytes"),
                "isBase64Encoded": true
            })))
            .await
            .unwrap();
        assert_eq!(text(&response), "|raw bytes");

        let response = adapter
            .handle(event(json!({"httpMethod": "POST", "path": "/binary"})))
            .await
            .unwrap();
        assert!(response.is_base64_encoded);
        assert!(matches!(
            &response.body,
            Some(EventBody::Binary(bytes)) if bytes == &vec![0xff, 0x00, 0xfe]
        ));

        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["body"], BASE64.encode([0xff, 0x00, 0xfe]));
    }

    #[tokio::test]
    async fn test_multi_value_headers_win_over_single_values() {
        let adapter = InvocationAdapter::new(echo_router());

        let response = adapter
            .handle(event(json!({
                "httpMethod": "POST",
                "path": "/echo",
                "headers": {"x-tag": "second"},
                "multiValueHeaders": {"x-tag": ["first", "second"]}
            })))
            .await
            .unwrap();

        assert_eq!(response.headers.get("x-tag").unwrap(), "first,second");
    }

    #[test]
    fn test_query_is_rebuilt_in_key_order() {
        let request = into_http_request(event(json!({
            "httpMethod": "POST",
            "path": "/grafana",
            "multiValueQueryStringParameters": {"user": ["u&1"], "token": ["t=1"]}
        })))
        .unwrap();

        assert_eq!(
            request.uri().to_string(),
            "/grafana?token=t%3D1&user=u%261"
        );
    }

    #[test]
    fn test_null_collections_deserialize_as_empty() {
        let request = into_http_request(event(json!({
            "httpMethod": "POST",
            "path": "/grafana",
            "headers": null,
            "multiValueHeaders": null,
            "queryStringParameters": null,
            "multiValueQueryStringParameters": null,
            "body": null,
            "isBase64Encoded": false
        })))
        .unwrap();

        assert_eq!(request.uri(), "/grafana");
        assert!(request.headers().is_empty());
    }

    #[test]
    fn test_invalid_base64_body_is_rejected() {
        let result = into_http_request(event(json!({
            "httpMethod": "POST",
            "path": "/echo",
            "body": "not base64!",
            "isBase64Encoded": true
        })));

        assert!(matches!(result, Err(InvocationError::Body(_))));
    }
}
