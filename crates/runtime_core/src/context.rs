use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{DEFAULT_CONTAINER, ParamEnvelope, UrlFormat, is_reserved_query_key};
use crate::storage::StorageCell;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("{0} is not supported in this environment")]
    Unsupported(&'static str),
}

/// Picks the storage cell for one request when the runtime does not share
/// a single cell.
pub type StorageFactory = Arc<dyn Fn(&ParamEnvelope) -> Arc<StorageCell> + Send + Sync>;

/// Everything a handler can see about its invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Query, params and secrets merged (later sources win), plus body keys
    /// when the envelope asks for body merging.
    pub data: Map<String, Value>,
    pub params: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub request_id: String,
    pub container: String,
    pub url_format: UrlFormat,
    /// Parsed body; `None` when no body was read or it failed to parse.
    pub body: Option<Value>,
    pub raw_body: Option<String>,
    pub token: Option<String>,
    pub storage: Arc<StorageCell>,
}

impl ExecutionContext {
    pub fn storage(&self) -> &StorageCell {
        &self.storage
    }

    pub fn create_token(&self, _options: &Value) -> Result<String, ContextError> {
        Err(ContextError::Unsupported("create_token"))
    }

    pub fn create_token_url(&self, _options: &Value) -> Result<String, ContextError> {
        Err(ContextError::Unsupported("create_token_url"))
    }
}

/// Raw inputs for one context.
#[derive(Debug, Default)]
pub struct ContextMaterials {
    /// Envelope with query overrides already applied.
    pub envelope: ParamEnvelope,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Buffered body, when the dispatcher read it.
    pub body: Option<Bytes>,
    pub storage: Option<Arc<StorageCell>>,
}

#[derive(Clone)]
pub struct ContextBuilder {
    shared: Arc<StorageCell>,
    factory: Option<StorageFactory>,
    default_container: String,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("default_container", &self.default_container)
            .field("per_request_storage", &self.factory.is_some())
            .finish()
    }
}

impl ContextBuilder {
    pub fn new(shared: Arc<StorageCell>) -> Self {
        Self {
            shared,
            factory: None,
            default_container: DEFAULT_CONTAINER.to_string(),
        }
    }

    pub fn with_storage_factory(mut self, factory: StorageFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_default_container(mut self, container: impl Into<String>) -> Self {
        self.default_container = container.into();
        self
    }

    pub fn shared_storage(&self) -> &Arc<StorageCell> {
        &self.shared
    }

    pub fn build(&self, materials: ContextMaterials) -> ExecutionContext {
        let ContextMaterials {
            envelope,
            query,
            headers,
            body,
            storage,
        } = materials;

        let query: BTreeMap<String, String> = query
            .into_iter()
            .filter(|(key, _)| !is_reserved_query_key(key))
            .collect();

        let mut data = Map::new();
        for (key, value) in query
            .iter()
            .chain(envelope.params.iter())
            .chain(envelope.secrets.iter())
        {
            data.insert(key.clone(), Value::String(value.clone()));
        }

        let content_type = headers.get("content-type").map(String::as_str);
        let parsed = body
            .as_ref()
            .and_then(|bytes| parse_body(content_type, bytes));
        let raw_body = body.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        if envelope.merge_body {
            if let Some(Value::Object(fields)) = &parsed {
                for (key, value) in fields {
                    if !data.contains_key(key) {
                        data.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        let storage = storage.unwrap_or_else(|| match &self.factory {
            Some(factory) => factory(&envelope),
            None => Arc::clone(&self.shared),
        });

        ExecutionContext {
            data,
            query,
            headers,
            request_id: envelope
                .request_id
                .unwrap_or_else(|| nanoid::nanoid!()),
            container: envelope
                .container
                .unwrap_or_else(|| self.default_container.clone()),
            url_format: envelope.url_format,
            body: parsed,
            raw_body,
            token: envelope.auth_token,
            params: envelope.params,
            secrets: envelope.secrets,
            meta: envelope.meta,
            storage,
        }
    }
}

/// Best effort: bodies that do not parse leave `body` unset.
fn parse_body(content_type: Option<&str>, bytes: &[u8]) -> Option<Value> {
    let mime = content_type?
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "application/json" => match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!("ignoring unparsable JSON body: {}", err);
                None
            }
        },
        "application/x-www-form-urlencoded" => {
            let fields = url::form_urlencoded::parse(bytes)
                .into_owned()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            Some(Value::Object(fields))
        }
        _ => None,
    }
}
