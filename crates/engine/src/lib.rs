pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod provision;

pub use compiler::{BuiltinCompiler, CompileOptions, CompiledHandler, Compiler};
pub use config::{ConfigError, EnvelopeDefaults, ParseBodySetting, RuntimeConfig};
pub use dispatch::{Dispatcher, Invocation, InvocationOutcome, PreparedRequest, fault_response};
pub use engine::{EngineBuilder, EngineError, HandlerSource, RuntimeEngine};
pub use provision::{ProvisionPlan, ProvisioningGate};
