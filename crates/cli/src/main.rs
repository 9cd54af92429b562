use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use engine::{BuiltinCompiler, CompileOptions, HandlerSource, RuntimeConfig, RuntimeEngine};
use runtime_core::env::{handler_input_with, normalize_handler_path_with};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "wtlocal")]
#[command(about = "Serve a handler locally over HTTP", long_about = None)]
struct Cli {
    /// Port to listen on (overrides config and WTLOCAL_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// File the storage cell is persisted to
    #[arg(long, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Container name stamped into envelopes and tokens
    #[arg(long)]
    container: Option<String>,

    /// Handler source file or built-in handler name
    handler: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(file) = &self.storage {
            config.storage_file = Some(file.clone());
        }
        if let Some(container) = &self.container {
            config.container = container.clone();
        }
    }
}

/// A handler argument is either a file holding the handler source or the
/// name of a built-in handler.
fn resolve_source(input: &str) -> Result<HandlerSource> {
    let path = normalize_handler_path_with(
        input,
        &|| std::env::current_dir().ok(),
        &|path: &Path| path.canonicalize().ok(),
    );
    if !path.is_file() {
        return Ok(HandlerSource::source(input));
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read handler {}", path.display()))?;
    Ok(HandlerSource::Source {
        text,
        options: CompileOptions {
            filename: Some(path),
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RuntimeConfig::load()?;
    config.apply_env()?;
    cli.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let input = handler_input_with(cli.handler.as_slice(), &|key: &str| std::env::var(key).ok())
        .or_else(|| config.handler.clone());
    let Some(input) = input else {
        let builtins = BuiltinCompiler::new();
        let names: Vec<&str> = builtins.names().collect();
        bail!("no handler given; pass a file or one of: {}", names.join(", "));
    };
    let source = resolve_source(&input)?;

    let port = config.port;
    let engine = RuntimeEngine::new(config, source).context("failed to start runtime")?;
    tracing::info!("serving handler {}", input);
    http::serve_http(Arc::new(engine), port).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from(["wtlocal", "--port", "9000", "--storage", "data.json", "echo"]).unwrap();
        assert_eq!(cli.handler.as_deref(), Some("echo"));

        let mut config = RuntimeConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage_file, Some(PathBuf::from("data.json")));
        assert_eq!(config.container, RuntimeConfig::default().container);
    }

    #[test]
    fn rejects_unknown_flags_and_bad_ports() {
        assert!(Cli::try_parse_from(["wtlocal", "--verbose"]).is_err());
        assert!(Cli::try_parse_from(["wtlocal", "--port", "http"]).is_err());
        assert!(Cli::try_parse_from(["wtlocal", "--port"]).is_err());
    }

    #[test]
    fn builtin_names_stay_names() {
        let source = resolve_source("hello-world-1").unwrap();
        assert!(matches!(source, HandlerSource::Source { text, options } if text == "hello-world-1" && options.filename.is_none()));
    }

    #[test]
    fn handler_files_are_read_with_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("handler.txt");
        std::fs::write(&file, "echo\n").unwrap();

        let source = resolve_source(file.to_str().unwrap()).unwrap();
        match source {
            HandlerSource::Source { text, options } => {
                assert_eq!(text, "echo\n");
                assert_eq!(options.filename, Some(file));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }
}
