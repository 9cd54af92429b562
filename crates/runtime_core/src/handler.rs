//! Calling conventions a handler can be registered under, and the two
//! one-shot channels handlers use to report their outcome.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::context::ExecutionContext;
use crate::error::ScriptError;
use crate::request::{HandlerResponse, InboundRequest};

pub type RawFn =
    dyn Fn(ExecutionContext, InboundRequest, ResponseSink) -> Result<(), ScriptError> + Send + Sync;
pub type CallbackFn = dyn Fn(Completion) -> Result<(), ScriptError> + Send + Sync;
pub type ContextFn = dyn Fn(ExecutionContext, Completion) -> Result<(), ScriptError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `(ctx, request, response)`: the handler writes the response itself.
    ThreeArg,
    /// `(cb)`
    Callback1,
    /// `(ctx, cb)`
    Callback2,
}

impl Signature {
    pub fn arity(self) -> usize {
        match self {
            Signature::Callback1 => 1,
            Signature::Callback2 => 2,
            Signature::ThreeArg => 3,
        }
    }

    pub fn from_arity(arity: usize) -> Option<Self> {
        match arity {
            1 => Some(Signature::Callback1),
            2 => Some(Signature::Callback2),
            3 => Some(Signature::ThreeArg),
            _ => None,
        }
    }
}

/// A runnable handler. Returning `Err` (or panicking) is a synchronous
/// fault; asynchronous outcomes go through the completion or the sink.
#[derive(Clone)]
pub enum Handler {
    Raw(Arc<RawFn>),
    Callback(Arc<CallbackFn>),
    WithContext(Arc<ContextFn>),
}

impl Handler {
    pub fn raw<F>(f: F) -> Self
    where
        F: Fn(ExecutionContext, InboundRequest, ResponseSink) -> Result<(), ScriptError>
            + Send
            + Sync
            + 'static,
    {
        Handler::Raw(Arc::new(f))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Completion) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        Handler::Callback(Arc::new(f))
    }

    pub fn with_context<F>(f: F) -> Self
    where
        F: Fn(ExecutionContext, Completion) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        Handler::WithContext(Arc::new(f))
    }

    pub fn signature(&self) -> Signature {
        match self {
            Handler::Raw(_) => Signature::ThreeArg,
            Handler::Callback(_) => Signature::Callback1,
            Handler::WithContext(_) => Signature::Callback2,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.signature()).finish()
    }
}

/// What a completion delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResult {
    /// Compact JSON ready to send.
    Data(String),
    Failed(ScriptError),
    /// The success value could not be turned into JSON.
    Unserializable(String),
}

/// Single-use callback handed to the completion-based conventions.
/// Dropping it without calling any method is reported as a server error.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<CompletionResult>,
}

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<CompletionResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn succeed<T>(self, data: &T)
    where
        T: Serialize + ?Sized,
    {
        let result = match serde_json::to_value(data) {
            Ok(serde_json::Value::Null) => CompletionResult::Data("{}".to_string()),
            Ok(value) => match serde_json::to_string(&value) {
                Ok(json) => CompletionResult::Data(json),
                Err(err) => CompletionResult::Unserializable(err.to_string()),
            },
            Err(err) => CompletionResult::Unserializable(err.to_string()),
        };
        self.send(result);
    }

    /// Success without data; the client receives `{}`.
    pub fn finish(self) {
        self.send(CompletionResult::Data("{}".to_string()));
    }

    pub fn fail(self, err: impl Into<ScriptError>) {
        self.send(CompletionResult::Failed(err.into()));
    }

    pub fn done<T, E>(self, result: Result<T, E>)
    where
        T: Serialize,
        E: Into<ScriptError>,
    {
        match result {
            Ok(data) => self.succeed(&data),
            Err(err) => self.fail(err),
        }
    }

    fn send(self, result: CompletionResult) {
        // The receiver is gone once a synchronous fault has been answered.
        if self.tx.send(result).is_err() {
            tracing::debug!("completion signalled after the request was answered");
        }
    }
}

/// Response produced through a [`ResponseSink`].
#[derive(Debug)]
pub struct SinkOutput {
    pub response: HandlerResponse,
    /// `true` when the handler called `end`, `false` when the sink was
    /// finalized by being dropped.
    pub ended: bool,
}

/// Writable response for the three-argument convention. The response is
/// delivered on `end`, or with whatever was written when the sink drops.
pub struct ResponseSink {
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
    tx: Option<oneshot::Sender<SinkOutput>>,
}

impl ResponseSink {
    pub fn channel() -> (Self, oneshot::Receiver<SinkOutput>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            status: 200,
            headers: Vec::new(),
            body: BytesMut::new(),
            tx: Some(tx),
        };
        (sink, rx)
    }

    pub fn write_head<I, K, V>(&mut self, status: u16, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.status = status;
        for (name, value) in headers {
            self.set_header(name, value);
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Replaces any existing header of the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.headers.retain(|(existing, _)| *existing != name);
        self.headers.push((name, value.into()));
    }

    pub fn write(&mut self, chunk: impl AsRef<[u8]>) {
        self.body.extend_from_slice(chunk.as_ref());
    }

    pub fn end(mut self) {
        self.deliver(true);
    }

    pub fn end_with(mut self, chunk: impl AsRef<[u8]>) {
        self.write(chunk);
        self.deliver(true);
    }

    fn deliver(&mut self, ended: bool) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let response = HandlerResponse {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
            body: Bytes::from(std::mem::take(&mut self.body)),
        };
        let _ = tx.send(SinkOutput { response, ended });
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        self.deliver(false);
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("written", &self.body.len())
            .finish()
    }
}
