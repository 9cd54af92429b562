//! Environment lookups with injectable getters so callers and tests never
//! touch the process environment directly.

use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const HANDLER_ENV: &str = "WTLOCAL_HANDLER";

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reads and parses a variable. Unset or blank variables yield `Ok(None)`;
/// a value that does not parse is returned as the error.
pub fn env_parse_with<T, F>(var: &str, env_get: &F) -> Result<Option<T>, String>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match env_get(var) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| value),
        _ => Ok(None),
    }
}

/// Handler named on the command line, else in the environment.
pub fn handler_input_with<Get>(positionals: &[String], env_get: &Get) -> Option<String>
where
    Get: Fn(&str) -> Option<String>,
{
    positionals
        .first()
        .cloned()
        .or_else(|| env_get(HANDLER_ENV))
        .filter(|handler| !handler.trim().is_empty())
}

pub fn normalize_handler_path_with<Cwd, Canonicalize>(
    path: &str,
    cwd_get: &Cwd,
    canonicalize: &Canonicalize,
) -> PathBuf
where
    Cwd: Fn() -> Option<PathBuf>,
    Canonicalize: Fn(&Path) -> Option<PathBuf>,
{
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let cwd = match cwd_get() {
        Some(dir) => dir,
        None => return path.to_path_buf(),
    };
    let joined = cwd.join(path);
    canonicalize(&joined).unwrap_or(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "", "maybe"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn parse_distinguishes_unset_from_invalid() {
        let env = HashMap::<String, String>::from([
            ("PORT".into(), "9000".into()),
            ("BAD".into(), "ninety".into()),
            ("BLANK".into(), " ".into()),
        ]);
        let env_get = |k: &str| env.get(k).cloned();
        assert_eq!(env_parse_with::<u16, _>("PORT", &env_get), Ok(Some(9000)));
        assert_eq!(env_parse_with::<u16, _>("MISSING", &env_get), Ok(None));
        assert_eq!(env_parse_with::<u16, _>("BLANK", &env_get), Ok(None));
        assert_eq!(
            env_parse_with::<u16, _>("BAD", &env_get),
            Err("ninety".to_string())
        );
    }

    #[test]
    fn handler_input_prefers_first_positional() {
        let env = HashMap::<String, String>::from([(HANDLER_ENV.into(), "echo".into())]);
        let env_get = |k: &str| env.get(k).cloned();
        assert_eq!(
            handler_input_with(&["hello-world-1".into()], &env_get).as_deref(),
            Some("hello-world-1")
        );
        assert_eq!(handler_input_with(&[], &env_get).as_deref(), Some("echo"));
        assert_eq!(handler_input_with(&[], &|_k: &str| None), None);
    }

    #[test]
    fn normalize_handler_path_with_uses_injected_closures() {
        let cwd = || Some(PathBuf::from("/tmp/project"));
        let canonicalize = |_path: &Path| None;
        let path = normalize_handler_path_with("handler.txt", &cwd, &canonicalize);
        assert_eq!(path, PathBuf::from("/tmp/project/handler.txt"));
        assert_eq!(
            normalize_handler_path_with("/abs/handler.txt", &cwd, &canonicalize),
            PathBuf::from("/abs/handler.txt")
        );
    }
}
