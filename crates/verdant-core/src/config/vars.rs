//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` / `${VAR}`: required, error if unset
//! - `${VAR:-default}`: default when unset or empty
//! - `${VAR-default}`: default only when unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<default>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("static interpolation pattern")
});

/// Outcome of interpolating a config document.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    /// One message per unresolved reference, in document order.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Substitute environment references in `input`.
///
/// Unresolved references are left in place and reported, so a config with
/// several missing variables lists all of them at once.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();
    let text = REFERENCE
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();
    InterpolationResult { text, errors }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if caps.name("escape").is_some() {
        return "$".to_string();
    }

    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return whole.to_string();
    };
    let name = name.as_str();
    let op = caps.name("op").map(|m| m.as_str());
    let default = caps.name("default").map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{name}' contains a newline, which is not allowed"
            ));
            whole.to_string()
        }
        Ok(value) if value.is_empty() && op == Some(":-") => default.unwrap_or_default().to_string(),
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                whole.to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let saved: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();
        // SAFETY: every test uses its own variable names and restores them.
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        let result = f();
        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        result
    }

    #[test]
    fn test_bare_and_braced() {
        with_env(&[("VERDANT_TEST_REGISTRY", Some("http://registry:8081"))], || {
            let result = interpolate("a: $VERDANT_TEST_REGISTRY\nb: ${VERDANT_TEST_REGISTRY}/x");
            assert!(result.is_ok());
            assert_eq!(
                result.text,
                "a: http://registry:8081\nb: http://registry:8081/x"
            );
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env(
            &[("VERDANT_TEST_MISSING_A", None), ("VERDANT_TEST_MISSING_B", None)],
            || {
                let result = interpolate("a: $VERDANT_TEST_MISSING_A\nb: ${VERDANT_TEST_MISSING_B}");
                assert_eq!(result.errors.len(), 2);
                assert!(result.errors[0].contains("VERDANT_TEST_MISSING_A"));
                assert!(result.errors[1].contains("VERDANT_TEST_MISSING_B"));
                assert!(result.text.contains("$VERDANT_TEST_MISSING_A"));
            },
        );
    }

    #[test]
    fn test_defaults() {
        with_env(
            &[("VERDANT_TEST_UNSET", None), ("VERDANT_TEST_EMPTY", Some(""))],
            || {
                let result = interpolate(
                    "a: ${VERDANT_TEST_UNSET:-one}\nb: ${VERDANT_TEST_EMPTY:-two}\nc: ${VERDANT_TEST_EMPTY-three}\nd: ${VERDANT_TEST_UNSET-four}",
                );
                assert!(result.is_ok());
                assert_eq!(result.text, "a: one\nb: two\nc: \nd: four");
            },
        );
    }

    #[test]
    fn test_newline_rejected() {
        with_env(&[("VERDANT_TEST_NEWLINE", Some("a\nb"))], || {
            let result = interpolate("x: $VERDANT_TEST_NEWLINE");
            assert!(!result.is_ok());
            assert!(result.errors[0].contains("newline"));
        });
    }

    #[test]
    fn test_escape() {
        let result = interpolate("price: $$5");
        assert!(result.is_ok());
        assert_eq!(result.text, "price: $5");
    }
}
