//! TOML configuration loading shared by the hub and payee binaries.
//!
//! A config file is read (a missing file means "all defaults"), `$VAR` and
//! `${VAR}` references are expanded, and the result is deserialized. Each
//! service then applies its own environment overrides on top.
//!
//! Variable lookups go through an [`EnvLookup`] so tests never touch the
//! process environment.

use std::path::Path;

use serde::de::DeserializeOwned;

/// Resolves a variable name to its value.
pub trait EnvLookup {
    /// Value of `name`, or `None` if unset.
    fn var(&self, name: &str) -> Option<String>;

    /// Value of `name` with surrounding whitespace removed; empty counts as unset.
    fn non_empty(&self, name: &str) -> Option<String> {
        self.var(name)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    /// Parses `name` with [`std::str::FromStr`], ignoring unset or unparsable values.
    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.non_empty(name).and_then(|v| v.parse().ok())
    }
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl<F: Fn(&str) -> Option<String>> EnvLookup for F {
    fn var(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Config loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for the target type.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File path.
        path: String,
        /// Parser message.
        message: String,
    },
    /// A required setting is absent or malformed.
    #[error("{0}")]
    Invalid(String),
}

/// Reads `path` (if present), expands variables and deserializes with `parse`.
///
/// The parser is injected so this crate does not pick a TOML implementation
/// for its callers.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read or parsed.
pub fn load_file<T, P, E>(path: &str, env: &impl EnvLookup, parse: P) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    P: FnOnce(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    let content = if Path::new(path).exists() {
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?
    } else {
        String::new()
    };
    let expanded = expand_env_vars(&content, env);
    parse(&expanded).map_err(|e| ConfigError::Parse {
        path: path.to_owned(),
        message: e.to_string(),
    })
}

/// Expands `$VAR` and `${VAR}` patterns. Unresolved variables are left as-is.
#[must_use]
pub fn expand_env_vars(input: &str, env: &impl EnvLookup) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match (name.is_empty(), env.var(&name)) {
            (false, Some(value)) => result.push_str(&value),
            (true, _) => {
                result.push('$');
                if braced {
                    result.push('{');
                }
            }
            (false, None) => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if braced {
                    result.push('}');
                }
            }
        }
    }

    result
}
