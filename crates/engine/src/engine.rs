use std::sync::Arc;

use runtime_core::{
    ContextBuilder, Fault, HandlerResponse, HmacSigner, InboundRequest, ParamEnvelope, StorageCell,
    StorageError, StorageFactory, TokenClaims, TokenError, TokenSigner,
};
use thiserror::Error;

use crate::compiler::{BuiltinCompiler, CompileOptions, CompiledHandler, Compiler};
use crate::config::RuntimeConfig;
use crate::dispatch::Dispatcher;
use crate::provision::{ProvisionPlan, ProvisioningGate};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to sign development token: {0}")]
    Token(#[from] TokenError),

    #[error("handler declares {arity} parameters; supported handlers take 1, 2 or 3")]
    InvalidSignature { arity: usize },
}

/// Where the handler comes from.
#[derive(Debug, Clone)]
pub enum HandlerSource {
    /// Already callable; the runtime starts ready.
    Compiled(CompiledHandler),
    /// Compiled on the first request.
    Source { text: String, options: CompileOptions },
}

impl HandlerSource {
    pub fn source(text: impl Into<String>) -> Self {
        HandlerSource::Source {
            text: text.into(),
            options: CompileOptions::default(),
        }
    }
}

impl From<CompiledHandler> for HandlerSource {
    fn from(compiled: CompiledHandler) -> Self {
        HandlerSource::Compiled(compiled)
    }
}

impl From<runtime_core::Handler> for HandlerSource {
    fn from(handler: runtime_core::Handler) -> Self {
        HandlerSource::Compiled(CompiledHandler::new(handler))
    }
}

/// One runtime instance: a storage cell shared by every request and the
/// gate in front of the handler.
#[derive(Debug)]
pub struct RuntimeEngine {
    config: RuntimeConfig,
    storage: Arc<StorageCell>,
    gate: Arc<ProvisioningGate>,
}

impl RuntimeEngine {
    pub fn new(config: RuntimeConfig, source: HandlerSource) -> Result<Self, EngineError> {
        Self::builder(config).build(source)
    }

    pub fn builder(config: RuntimeConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            compiler: None,
            storage: None,
            storage_factory: None,
            signer: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageCell> {
        &self.storage
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Requests waiting for the handler to be provisioned.
    pub fn pending_requests(&self) -> usize {
        self.gate.queued_len()
    }

    pub async fn execute_request(&self, request: InboundRequest) -> HandlerResponse {
        let method = request.method.clone();
        let path = request.path().to_string();
        let response = self.gate.handle(request).await;
        tracing::debug!("{} {} -> {}", method, path, response.status);
        response
    }
}

pub struct EngineBuilder {
    config: RuntimeConfig,
    compiler: Option<Arc<dyn Compiler>>,
    storage: Option<Arc<StorageCell>>,
    storage_factory: Option<StorageFactory>,
    signer: Option<Arc<dyn TokenSigner>>,
}

impl EngineBuilder {
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Shares an existing cell instead of opening one from the config.
    pub fn storage(mut self, storage: Arc<StorageCell>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn storage_factory(mut self, factory: StorageFactory) -> Self {
        self.storage_factory = Some(factory);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn TokenSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self, source: HandlerSource) -> Result<RuntimeEngine, EngineError> {
        let EngineBuilder {
            config,
            compiler,
            storage,
            storage_factory,
            signer,
        } = self;

        let storage = match storage {
            Some(storage) => storage,
            None => Arc::new(StorageCell::open(
                config.initial_storage.clone(),
                config.storage_file.clone(),
            )?),
        };

        let mut contexts =
            ContextBuilder::new(Arc::clone(&storage)).with_default_container(config.container.clone());
        if let Some(factory) = storage_factory {
            contexts = contexts.with_storage_factory(factory);
        }

        let default_envelope = stamped_envelope(&config, signer)?;
        let max_body_size = config.max_body_size;
        let assemble = move |compiled: CompiledHandler| -> Result<Dispatcher, Fault> {
            Ok(Dispatcher::new(compiled, contexts)?
                .with_max_body_size(max_body_size)
                .with_default_envelope(default_envelope))
        };

        let gate = match source {
            HandlerSource::Compiled(compiled) => {
                let arity = compiled.arity;
                let dispatcher = assemble(compiled)
                    .map_err(|_| EngineError::InvalidSignature { arity })?;
                ProvisioningGate::ready(dispatcher)
            }
            HandlerSource::Source { text, options } => ProvisioningGate::pending(ProvisionPlan {
                compiler: compiler
                    .unwrap_or_else(|| Arc::new(BuiltinCompiler::new()) as Arc<dyn Compiler>),
                source: text,
                options,
                assemble: Box::new(assemble),
            }),
        };

        Ok(RuntimeEngine {
            config,
            storage,
            gate,
        })
    }
}

/// Envelope for requests without an `x-wt-params` header. Carries the
/// configured token, or a development token signed for the container.
fn stamped_envelope(
    config: &RuntimeConfig,
    signer: Option<Arc<dyn TokenSigner>>,
) -> Result<ParamEnvelope, EngineError> {
    let mut envelope = config.default_envelope();
    if envelope.auth_token.is_none() {
        let signer: Arc<dyn TokenSigner> = match (signer, &config.signing_secret) {
            (Some(signer), _) => signer,
            (None, Some(secret)) => Arc::new(HmacSigner::new(secret.as_bytes())),
            (None, None) => Arc::new(HmacSigner::random()),
        };
        envelope.auth_token = Some(signer.sign(&TokenClaims::for_container(&config.container))?);
    }
    Ok(envelope)
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("custom_compiler", &self.compiler.is_some())
            .finish_non_exhaustive()
    }
}
