//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `${VAR}` - substitute, error if unset
//! - `${VAR:-default}` - use default if VAR is unset or empty
//! - `$$` - literal `$`

use regex::Regex;
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("Invalid regex pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every variable that could not be resolved.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
///
/// Errors are accumulated so a config with several missing variables reports all of them.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                return "$".to_string();
            };
            let default = caps.get(2).map(|m| m.as_str());

            match (env::var(name), default) {
                (Ok(value), _) if value.contains('\n') => {
                    errors.push(format!("environment variable '{name}' contains newlines"));
                    String::new()
                }
                (Ok(value), Some(default)) if value.is_empty() => default.to_string(),
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    String::new()
                }
            }
        })
        .to_string();

    InterpolationResult { text, errors }
}
