pub mod context;
pub mod envelope;
pub mod env;
pub mod error;
pub mod handler;
pub mod request;
pub mod storage;
pub mod token;

pub use context::{ContextBuilder, ContextError, ContextMaterials, ExecutionContext, StorageFactory};
pub use envelope::{EnvelopeError, ParamEnvelope, ParseBody, UrlFormat};
pub use error::{CompileError, ErrorBody, Fault, ScriptError};
pub use handler::{Completion, CompletionResult, Handler, ResponseSink, Signature, SinkOutput};
pub use request::{BodyStream, HandlerResponse, InboundRequest, RequestBody};
pub use storage::{Etag, ExpectedEtag, SetOptions, StorageCell, StorageError};
pub use token::{HmacSigner, TokenClaims, TokenError, TokenSigner};
