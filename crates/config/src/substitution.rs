use anyhow::{Context, Result};
use regex::Regex;
use std::env;
use std::sync::OnceLock;
use tracing::{debug, warn};

const PLACEHOLDER: &str = r"\$\{(\w+)\}|\$(\w+)";

fn placeholder_regex() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = RE.get() {
        return Ok(re);
    }
    let re = Regex::new(PLACEHOLDER).context("Invalid placeholder pattern")?;
    Ok(RE.get_or_init(|| re))
}

/// Substitute environment variables in the format ${VAR_NAME} or $VAR_NAME
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = placeholder_regex()?;
    let mut result = content.to_string();
    let mut missing_vars = Vec::new();

    for caps in re.captures_iter(content) {
        let Some(var) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let var_name = var.as_str();
        let placeholder = &caps[0];

        match env::var(var_name) {
            Ok(value) => {
                debug!(var = var_name, "Substituting environment variable");
                result = result.replace(placeholder, &value);
            }
            Err(_) => {
                warn!("Environment variable '{}' not set", var_name);
                // Placeholder stays; the validator reports it
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        debug!(
            "Environment variables not set (may use defaults or fail validation): {:?}",
            missing_vars
        );
    }

    Ok(result)
}

/// Get environment variable with a default value
pub fn get_env_or_default(var_name: &str, default: &str) -> String {
    match env::var(var_name) {
        Ok(value) => value,
        Err(_) => {
            warn!(
                "Environment variable '{}' not set, using default: \"{}\"",
                var_name, default
            );
            default.to_string()
        }
    }
}

/// Check if a string contains unresolved environment variable placeholders
pub fn has_unresolved_env_vars(content: &str) -> bool {
    placeholder_regex()
        .map(|re| re.is_match(content))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_set_variables() {
        env::set_var("GREEKSTREAM_TEST_TOKEN", "tok-123");
        let out = substitute_env_vars("token: ${GREEKSTREAM_TEST_TOKEN}").unwrap();
        assert_eq!(out, "token: tok-123");
        assert!(!has_unresolved_env_vars(&out));
    }

    #[test]
    fn test_keeps_missing_placeholders() {
        let input = "token: ${GREEKSTREAM_SURELY_UNSET_VAR}";
        let out = substitute_env_vars(input).unwrap();
        assert_eq!(out, input);
        assert!(has_unresolved_env_vars(&out));
    }

    #[test]
    fn test_get_env_or_default() {
        assert_eq!(
            get_env_or_default("GREEKSTREAM_SURELY_UNSET_VAR", "fallback"),
            "fallback"
        );
    }
}
