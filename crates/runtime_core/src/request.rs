use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::error::{ErrorBody, Fault};

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Request payload as handed over by the transport. Reading it replaces a
/// stream with the buffered bytes so later consumers still see the payload.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            RequestBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Full(bytes)
        }
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

#[derive(Debug)]
pub struct InboundRequest {
    pub method: String,
    /// Path and query, e.g. `/run?x=1`.
    pub url: String,
    /// Lower-cased names; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
    pub remote_addr: Option<SocketAddr>,
}

impl InboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
            remote_addr: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.append_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    /// Decoded query parameters. When a key repeats, the last value wins.
    pub fn query(&self) -> BTreeMap<String, String> {
        match self.url.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => BTreeMap::new(),
        }
    }

    /// Buffers the whole body, enforcing `limit`. A declared content length
    /// above the limit fails before anything is read.
    pub async fn read_body(&mut self, limit: usize) -> Result<Bytes, Fault> {
        let declared = self.content_length();
        if declared.is_some_and(|length| length > limit) {
            return Err(Fault::SizeLimit { limit });
        }

        let bytes = match std::mem::take(&mut self.body) {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Full(bytes) => bytes,
            RequestBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|err| Fault::BodyRead(err.to_string()))?;
                    if buffer.len() + chunk.len() > limit {
                        return Err(Fault::SizeLimit { limit });
                    }
                    buffer.extend_from_slice(&chunk);
                }
                buffer.freeze()
            }
        };

        if bytes.len() > limit {
            return Err(Fault::SizeLimit { limit });
        }
        if let Some(length) = declared {
            if length != bytes.len() {
                return Err(Fault::BodyRead(format!(
                    "expected {} bytes, received {}",
                    length,
                    bytes.len()
                )));
            }
        }

        self.body = RequestBody::Full(bytes.clone());
        Ok(bytes)
    }

    /// Consumes whatever is left of a streamed body so the connection can
    /// be reused. Read errors are irrelevant at this point.
    pub async fn drain(&mut self) {
        if let RequestBody::Stream(mut stream) = std::mem::take(&mut self.body) {
            while stream.next().await.is_some() {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HandlerResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.into(),
        }
    }

    /// Renders a fault in the uniform error shape.
    pub fn from_fault(fault: &Fault) -> Result<Self, serde_json::Error> {
        let body = ErrorBody::from(fault);
        Ok(Self::json(body.code, body.to_json()?))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
