use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use runtime_core::{
    CompileError, Completion, ExecutionContext, Fault, Handler, InboundRequest, ResponseSink,
    ScriptError, SetOptions, Signature,
};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// File the source was read from, for diagnostics.
    pub filename: Option<PathBuf>,
}

/// A handler together with the parameter count it declares.
#[derive(Debug, Clone)]
pub struct CompiledHandler {
    pub arity: usize,
    pub handler: Handler,
}

impl CompiledHandler {
    pub fn new(handler: Handler) -> Self {
        Self {
            arity: handler.signature().arity(),
            handler,
        }
    }

    pub fn with_arity(arity: usize, handler: Handler) -> Self {
        Self { arity, handler }
    }

    /// The calling convention, provided the declared arity is supported and
    /// agrees with the handler's shape.
    pub fn signature(&self) -> Result<Signature, Fault> {
        match Signature::from_arity(self.arity) {
            Some(signature) if signature == self.handler.signature() => Ok(signature),
            _ => Err(Fault::InvalidSignature { arity: self.arity }),
        }
    }
}

impl From<Handler> for CompiledHandler {
    fn from(handler: Handler) -> Self {
        Self::new(handler)
    }
}

/// Turns handler source into something the dispatcher can call.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        source: &str,
        options: &CompileOptions,
    ) -> Result<CompiledHandler, CompileError>;
}

/// Resolves source text to a registered handler by name.
#[derive(Debug, Clone)]
pub struct BuiltinCompiler {
    handlers: BTreeMap<String, CompiledHandler>,
}

impl Default for BuiltinCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinCompiler {
    /// Compiler preloaded with the bundled fixtures.
    pub fn new() -> Self {
        let mut compiler = Self::empty();
        compiler.register("hello-world-1", Handler::callback(hello_world_1));
        compiler.register("hello-world-2", Handler::with_context(hello_world_2));
        compiler.register("hello-world-3", Handler::raw(hello_world_3));
        compiler.register("echo", Handler::raw(echo));
        compiler.register("storage-set-query", Handler::with_context(storage_set_query));
        compiler
    }

    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Into<CompiledHandler>) {
        self.handlers.insert(name.into(), handler.into());
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(normalize_source(name))
    }
}

fn normalize_source(source: &str) -> &str {
    source.strip_prefix('\u{feff}').unwrap_or(source).trim()
}

#[async_trait]
impl Compiler for BuiltinCompiler {
    async fn compile(
        &self,
        source: &str,
        options: &CompileOptions,
    ) -> Result<CompiledHandler, CompileError> {
        let name = normalize_source(source);
        if name.is_empty() {
            return Err(CompileError::new("A handler is required."));
        }
        match self.handlers.get(name) {
            Some(compiled) => {
                tracing::debug!("compiled handler {:?} (arity {})", name, compiled.arity);
                Ok(compiled.clone())
            }
            None => {
                let origin = options
                    .filename
                    .as_ref()
                    .map(|path| format!(" (from {})", path.display()))
                    .unwrap_or_default();
                let known: Vec<&str> = self.names().collect();
                Err(
                    CompileError::new(format!("Unknown handler {:?}{}.", name, origin))
                        .with_details(format!("Known handlers: {}", known.join(", "))),
                )
            }
        }
    }
}

fn hello_world_1(cb: Completion) -> Result<(), ScriptError> {
    cb.succeed("hello world");
    Ok(())
}

fn hello_world_2(_ctx: ExecutionContext, cb: Completion) -> Result<(), ScriptError> {
    cb.succeed("hello world");
    Ok(())
}

fn hello_world_3(
    _ctx: ExecutionContext,
    _req: InboundRequest,
    mut res: ResponseSink,
) -> Result<(), ScriptError> {
    res.write_head(200, [("Content-Type", "application/json")]);
    res.end_with("\"hello world\"");
    Ok(())
}

fn echo(ctx: ExecutionContext, req: InboundRequest, mut res: ResponseSink) -> Result<(), ScriptError> {
    let body = json!({
        "url": req.url,
        "method": req.method,
        "body": ctx.body,
        "query": ctx.query,
        "secrets": ctx.secrets,
        "params": ctx.params,
    });
    res.write_head(200, [("Content-Type", "application/json")]);
    res.end_with(serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Reads storage, stores the query, then reports the value read and the
/// etag at each step. Completes asynchronously, after the write lands.
fn storage_set_query(ctx: ExecutionContext, cb: Completion) -> Result<(), ScriptError> {
    let initial_etag = ctx.storage.etag();
    let data = ctx.storage.get();
    let after_read_etag = ctx.storage.etag();

    let query: Map<String, Value> = ctx
        .query
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();

    tokio::spawn(async move {
        if let Err(err) = ctx
            .storage
            .set(Some(Value::Object(query)), SetOptions::default())
            .await
        {
            cb.fail(err);
            return;
        }

        let mut report = Map::new();
        if let Some(data) = data {
            report.insert("data".into(), data);
        }
        for (key, etag) in [
            ("etag", ctx.storage.etag()),
            ("initialEtag", initial_etag),
            ("afterReadEtag", after_read_etag),
        ] {
            if let Some(etag) = etag.to_json() {
                report.insert(key.into(), etag);
            }
        }
        cb.succeed(&report);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_fixtures_by_trimmed_name() {
        let compiler = BuiltinCompiler::new();
        let compiled = compiler
            .compile("\u{feff}  hello-world-2\n", &CompileOptions::default())
            .await
            .expect("compile");
        assert_eq!(compiled.arity, 2);
        assert_eq!(compiled.signature().expect("signature"), Signature::Callback2);
    }

    #[tokio::test]
    async fn unknown_names_are_bad_requests() {
        let compiler = BuiltinCompiler::new();
        let err = compiler
            .compile("missing", &CompileOptions::default())
            .await
            .expect_err("unknown");
        assert_eq!(err.code, 400);
        assert!(err.message.contains("missing"));
        assert!(err.details.as_deref().is_some_and(|d| d.contains("echo")));

        let err = compiler
            .compile("   ", &CompileOptions::default())
            .await
            .expect_err("empty");
        assert_eq!(err.code, 400);
    }

    #[test]
    fn declared_arity_must_be_supported_and_consistent() {
        let raw = Handler::raw(|_ctx, _req, res| {
            res.end();
            Ok(())
        });
        assert!(CompiledHandler::new(raw.clone()).signature().is_ok());

        for arity in [0, 2, 4] {
            let err = CompiledHandler::with_arity(arity, raw.clone())
                .signature()
                .expect_err("unsupported");
            assert!(matches!(err, Fault::InvalidSignature { arity: a } if a == arity));
        }
    }

    #[test]
    fn registered_handlers_are_listed() {
        let mut compiler = BuiltinCompiler::empty();
        compiler.register(
            "noop",
            Handler::callback(|cb| {
                cb.finish();
                Ok(())
            }),
        );
        assert!(compiler.contains(" noop "));
        assert_eq!(compiler.names().collect::<Vec<_>>(), vec!["noop"]);
    }
}
