use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use runtime_core::{HandlerResponse, InboundRequest, RequestBody};

use engine::RuntimeEngine;

pub fn app_router(engine: Arc<RuntimeEngine>) -> Router {
    Router::new().fallback(handle_request).with_state(engine)
}

async fn handle_request(State(engine): State<Arc<RuntimeEngine>>, request: Request) -> Response {
    let inbound = inbound_request(request);
    tracing::debug!("[http] request {} {}", inbound.method, inbound.url);
    let response = engine.execute_request(inbound).await;
    into_response(response)
}

/// Converts an axum request without buffering its body.
pub fn inbound_request(request: Request) -> InboundRequest {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut inbound = InboundRequest::new(parts.method.as_str(), url);
    for (name, value) in parts.headers.iter() {
        match value.to_str() {
            Ok(value) => inbound.append_header(name.as_str(), value),
            Err(_) => tracing::debug!("[http] dropping non-ASCII header {}", name),
        }
    }
    inbound.remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    inbound.body = RequestBody::Stream(Box::pin(stream));
    inbound
}

pub fn into_response(response: HandlerResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!("[http] handler produced an invalid response: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Server error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn converts_requests_with_streaming_bodies() {
        let request = Request::builder()
            .method("POST")
            .uri("/run?x=1")
            .header("X-Custom", "value")
            .body(Body::from("payload"))
            .unwrap();

        let mut inbound = inbound_request(request);
        assert_eq!(inbound.method, "POST");
        assert_eq!(inbound.url, "/run?x=1");
        assert_eq!(inbound.header("x-custom"), Some("value"));
        assert!(matches!(inbound.body, RequestBody::Stream(_)));
        assert_eq!(&inbound.read_body(64).await.unwrap()[..], b"payload");
    }

    #[test]
    fn invalid_statuses_degrade_to_server_error() {
        let response = into_response(HandlerResponse::new(1000));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = into_response(HandlerResponse::json(201, "{}"));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
