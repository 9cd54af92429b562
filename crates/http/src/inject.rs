//! Socket-free requests against the router, for tests and the simulator.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use bytes::Bytes;
use engine::{EngineError, HandlerSource, RuntimeConfig, RuntimeEngine};
use runtime_core::envelope::{ENVELOPE_HEADER, append_query, prepare_url};
use runtime_core::{EnvelopeError, HmacSigner, ParamEnvelope, ParseBody, StorageCell};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tower::ServiceExt;

use crate::router::app_router;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("failed to read response body: {0}")]
    Body(axum::Error),

    #[error("failed to encode envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("failed to start runtime: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone)]
pub struct InjectRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Bytes>,
    /// Host header; `localhost` when unset.
    pub authority: Option<String>,
    pub remote_address: Option<SocketAddr>,
}

impl Default for InjectRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: "/".to_string(),
            headers: Vec::new(),
            payload: None,
            authority: None,
            remote_address: None,
        }
    }
}

impl InjectRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn post(url: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON payload with a matching content type.
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.payload = Some(Bytes::from(value.to_string()));
        self.header(CONTENT_TYPE.as_str(), "application/json")
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct InjectedResponse {
    pub status_code: u16,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
}

impl InjectedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

pub async fn inject(router: Router, request: InjectRequest) -> Result<InjectedResponse, InjectError> {
    let mut builder = Request::builder()
        .method(request.method.as_str())
        .uri(request.url.as_str())
        .header(HOST, request.authority.as_deref().unwrap_or("localhost"));
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let declared_length = request.has_header(CONTENT_LENGTH.as_str());
    let payload = request.payload.unwrap_or_default();
    if !payload.is_empty() && !declared_length {
        builder = builder.header(CONTENT_LENGTH, payload.len());
    }

    let mut http_request = builder.body(Body::from(payload))?;
    if let Some(addr) = request.remote_address {
        http_request.extensions_mut().insert(ConnectInfo(addr));
    }

    let response = match router.oneshot(http_request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };
    let (parts, body) = response.into_parts();
    let payload = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(InjectError::Body)?;
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    Ok(InjectedResponse {
        status_code: parts.status.as_u16(),
        payload,
        headers,
    })
}

/// One request against a fresh runtime, with the envelope stamped from the
/// options.
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    pub request: InjectRequest,
    /// Extra query parameters merged into the request URL.
    pub query: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub merge_body: bool,
    pub parse_body: bool,
    pub container: Option<String>,
    pub token: Option<String>,
    pub signing_secret: Option<String>,
    pub initial_storage: Option<serde_json::Value>,
    /// Share a cell across simulations instead of starting empty.
    pub storage: Option<Arc<StorageCell>>,
}

pub async fn simulate(
    source: impl Into<HandlerSource>,
    options: SimulateOptions,
) -> Result<InjectedResponse, InjectError> {
    let SimulateOptions {
        mut request,
        query,
        params,
        secrets,
        meta,
        merge_body,
        parse_body,
        container,
        token,
        signing_secret,
        initial_storage,
        storage,
    } = options;

    let mut config = RuntimeConfig {
        initial_storage,
        signing_secret: signing_secret.clone(),
        ..RuntimeConfig::default()
    };
    if let Some(container) = &container {
        config.container = container.clone();
    }

    let envelope = ParamEnvelope {
        merge_body,
        parse_body: if parse_body {
            ParseBody::Always
        } else {
            ParseBody::OnArity
        },
        params,
        secrets,
        meta,
        container: Some(config.container.clone()),
        auth_token: token,
        ..ParamEnvelope::default()
    };
    let signer = match &signing_secret {
        Some(secret) => HmacSigner::new(secret.as_bytes()),
        None => HmacSigner::random(),
    };
    let header = envelope.encode_signed(&signer)?;

    let mut builder = RuntimeEngine::builder(config);
    if let Some(storage) = storage {
        builder = builder.storage(storage);
    }
    let engine = builder.build(source.into())?;

    let url = append_query(
        &request.url,
        query.iter().map(|(key, value)| (key.as_str(), value.as_str())),
    );
    request.url = prepare_url(&url, &envelope);
    request.headers.push((ENVELOPE_HEADER.to_string(), header));

    inject(app_router(Arc::new(engine)), request).await
}
