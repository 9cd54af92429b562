//! Runs one request through a handler under its calling convention and
//! turns whatever the handler does into a response.
//!
//! Dispatch is split in two so queued requests can be replayed in order:
//! [`Dispatcher::prepare`] decodes the envelope and reads the body, and
//! [`Dispatcher::start`] calls the handler synchronously. The returned
//! [`Invocation`] then waits for the handler's asynchronous outcome.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use runtime_core::envelope::ENVELOPE_HEADER;
use runtime_core::{
    Completion, CompletionResult, ContextBuilder, ContextMaterials, Fault, Handler, HandlerResponse,
    InboundRequest, ParamEnvelope, ParseBody, ResponseSink, ScriptError, Signature, SinkOutput,
};
use tokio::sync::oneshot;

use crate::compiler::CompiledHandler;

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

type PanicPayload = Box<dyn Any + Send>;

#[derive(Debug)]
pub enum InvocationOutcome {
    /// JSON produced through a completion.
    Success(String),
    /// Response written by a three-argument handler.
    Responded(HandlerResponse),
    Faulted(Fault),
}

/// A request whose envelope has been decoded and whose body has been read
/// when the envelope asks for it.
#[derive(Debug)]
pub struct PreparedRequest {
    request: InboundRequest,
    stage: Result<ContextMaterials, Fault>,
}

impl PreparedRequest {
    pub fn fault(&self) -> Option<&Fault> {
        self.stage.as_ref().err()
    }
}

#[derive(Debug)]
enum Pending {
    Completion(oneshot::Receiver<CompletionResult>),
    Sink(oneshot::Receiver<SinkOutput>),
    Settled(InvocationOutcome),
}

/// A started handler call.
#[derive(Debug)]
pub struct Invocation {
    request: Option<InboundRequest>,
    pending: Pending,
    panic: Option<PanicPayload>,
}

impl Invocation {
    pub fn settled(outcome: InvocationOutcome) -> Self {
        Self {
            request: None,
            pending: Pending::Settled(outcome),
            panic: None,
        }
    }

    /// Waits for the handler to finish.
    pub async fn outcome(&mut self) -> InvocationOutcome {
        let pending = std::mem::replace(
            &mut self.pending,
            Pending::Settled(InvocationOutcome::Faulted(Fault::Server(
                "invocation already settled".to_string(),
            ))),
        );
        match pending {
            Pending::Settled(outcome) => outcome,
            Pending::Completion(rx) => match rx.await {
                Ok(result) => completion_outcome(result),
                Err(_) => InvocationOutcome::Faulted(Fault::Server(
                    "Handler finished without signalling its completion.".to_string(),
                )),
            },
            Pending::Sink(rx) => match rx.await {
                Ok(output) => InvocationOutcome::Responded(output.response),
                Err(_) => InvocationOutcome::Faulted(Fault::Server(
                    "Handler response was never finalized.".to_string(),
                )),
            },
        }
    }

    /// Waits for the outcome and renders it. A successful completion drains
    /// the rest of the request body first.
    pub async fn respond(mut self) -> HandlerResponse {
        let outcome = self.outcome().await;
        if let InvocationOutcome::Success(_) = &outcome {
            if let Some(request) = self.request.as_mut() {
                request.drain().await;
            }
        }
        match outcome {
            InvocationOutcome::Success(body) => HandlerResponse::json(200, body),
            InvocationOutcome::Responded(response) => response,
            InvocationOutcome::Faulted(fault) => match render_fault(&fault) {
                Ok(response) => response,
                Err(err) => match self.panic.take() {
                    Some(payload) => resume_unwind(payload),
                    None => server_error(&err),
                },
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    compiled: CompiledHandler,
    signature: Signature,
    contexts: ContextBuilder,
    max_body_size: usize,
    default_envelope: Option<ParamEnvelope>,
}

impl Dispatcher {
    /// Fails with `InvalidSignature` when the handler's declared arity is
    /// not one of the supported calling conventions.
    pub fn new(compiled: CompiledHandler, contexts: ContextBuilder) -> Result<Self, Fault> {
        let signature = compiled.signature()?;
        Ok(Self {
            compiled,
            signature,
            contexts,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            default_envelope: None,
        })
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Envelope applied to requests that carry no envelope header.
    pub fn with_default_envelope(mut self, envelope: ParamEnvelope) -> Self {
        self.default_envelope = Some(envelope);
        self
    }

    pub fn compiled(&self) -> &CompiledHandler {
        &self.compiled
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub async fn dispatch(&self, request: InboundRequest) -> HandlerResponse {
        let prepared = self.prepare(request).await;
        self.start(prepared).respond().await
    }

    pub async fn prepare(&self, mut request: InboundRequest) -> PreparedRequest {
        let stage = self.prepare_stage(&mut request).await;
        PreparedRequest { request, stage }
    }

    async fn prepare_stage(
        &self,
        request: &mut InboundRequest,
    ) -> Result<ContextMaterials, Fault> {
        let mut envelope = match request.header(ENVELOPE_HEADER) {
            Some(header) => ParamEnvelope::decode(Some(header))?,
            None => self.default_envelope.clone().unwrap_or_default(),
        };
        let query = request.query();
        envelope.apply_query_overrides(&query);

        let read_body = match envelope.parse_body {
            ParseBody::Always => true,
            ParseBody::Never => false,
            ParseBody::OnArity => self.signature != Signature::ThreeArg,
        };
        let body = if read_body {
            Some(request.read_body(self.max_body_size).await?)
        } else {
            None
        };

        Ok(ContextMaterials {
            envelope,
            query,
            headers: request.headers.clone(),
            body,
            storage: None,
        })
    }

    /// Calls the handler. Returns once the synchronous part of the handler
    /// has run; the asynchronous part settles through the invocation.
    pub fn start(&self, prepared: PreparedRequest) -> Invocation {
        let PreparedRequest { request, stage } = prepared;
        let materials = match stage {
            Ok(materials) => materials,
            Err(fault) => return Invocation::settled(InvocationOutcome::Faulted(fault)),
        };

        match &self.compiled.handler {
            Handler::Callback(handler) => {
                let (completion, rx) = Completion::channel();
                let result = catch_unwind(AssertUnwindSafe(|| handler(completion)));
                settle_completion(result, rx, request)
            }
            Handler::WithContext(handler) => {
                let ctx = self.contexts.build(materials);
                let (completion, rx) = Completion::channel();
                let result = catch_unwind(AssertUnwindSafe(|| handler(ctx, completion)));
                settle_completion(result, rx, request)
            }
            Handler::Raw(handler) => {
                let ctx = self.contexts.build(materials);
                let (sink, rx) = ResponseSink::channel();
                let result = catch_unwind(AssertUnwindSafe(|| handler(ctx, request, sink)));
                settle_sink(result, rx)
            }
        }
    }
}

fn sync_fault(result: std::thread::Result<Result<(), ScriptError>>) -> Option<(ScriptError, Option<PanicPayload>)> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some((err, None)),
        Err(payload) => Some((ScriptError::from_panic(&*payload), Some(payload))),
    }
}

fn settle_completion(
    result: std::thread::Result<Result<(), ScriptError>>,
    mut rx: oneshot::Receiver<CompletionResult>,
    request: InboundRequest,
) -> Invocation {
    let Some((err, panic)) = sync_fault(result) else {
        return Invocation {
            request: Some(request),
            pending: Pending::Completion(rx),
            panic: None,
        };
    };

    // A completion signalled before the fault has already decided the response.
    if let Ok(delivered) = rx.try_recv() {
        tracing::warn!("handler faulted after completing: {}", err);
        return Invocation {
            request: Some(request),
            pending: Pending::Settled(completion_outcome(delivered)),
            panic: None,
        };
    }

    Invocation {
        request: Some(request),
        pending: Pending::Settled(InvocationOutcome::Faulted(Fault::Unhandled(err))),
        panic,
    }
}

fn settle_sink(
    result: std::thread::Result<Result<(), ScriptError>>,
    mut rx: oneshot::Receiver<SinkOutput>,
) -> Invocation {
    let Some((err, panic)) = sync_fault(result) else {
        return Invocation {
            request: None,
            pending: Pending::Sink(rx),
            panic: None,
        };
    };

    // Only an explicit `end` counts as delivered; a sink dropped by the
    // fault itself does not.
    if let Ok(output) = rx.try_recv() {
        if output.ended {
            tracing::warn!("handler faulted after ending its response: {}", err);
            return Invocation::settled(InvocationOutcome::Responded(output.response));
        }
    }

    Invocation {
        request: None,
        pending: Pending::Settled(InvocationOutcome::Faulted(Fault::Unhandled(err))),
        panic,
    }
}

fn completion_outcome(result: CompletionResult) -> InvocationOutcome {
    match result {
        CompletionResult::Data(body) => InvocationOutcome::Success(body),
        CompletionResult::Failed(err) => InvocationOutcome::Faulted(Fault::Handler(err)),
        CompletionResult::Unserializable(message) => {
            InvocationOutcome::Faulted(Fault::Serialization(message))
        }
    }
}

fn render_fault(fault: &Fault) -> Result<HandlerResponse, serde_json::Error> {
    let response = HandlerResponse::from_fault(fault)?;
    tracing::info!("{}", response.body_text());
    Ok(response)
}

/// Error response for a fault raised outside a handler call.
pub fn fault_response(fault: &Fault) -> HandlerResponse {
    render_fault(fault).unwrap_or_else(|err| server_error(&err))
}

fn server_error(err: &serde_json::Error) -> HandlerResponse {
    tracing::error!("failed to render error response: {}", err);
    let mut response = HandlerResponse::new(500);
    response
        .headers
        .push(("content-type".to_string(), "text/plain".to_string()));
    response.body = "Server error".into();
    response
}
