//! Shared utility functions for provider adapters.

use agentrt_domain::config::AuthConfig;
use agentrt_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from an [`AuthConfig`].
///
/// Precedence: explicit `key` field (plaintext — warn), then `env`.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!("API key loaded from plaintext config field 'key' — prefer 'env'");
        return Ok(key.clone());
    }

    if let Some(ref env_var) = auth.env {
        return std::env::var(env_var).map_err(|_| {
            Error::Auth(format!(
                "environment variable '{}' not set or not valid UTF-8",
                env_var
            ))
        });
    }

    Err(Error::Auth(
        "no API key configured: set 'key' or 'env' in AuthConfig".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_api_key_plaintext() {
        let auth = AuthConfig {
            key: Some("sk-test-123".into()),
            ..Default::default()
        };
        let result = resolve_api_key(&auth).unwrap();
        assert_eq!(result, "sk-test-123");
    }

    #[test]
    fn resolve_api_key_env_var() {
        let var_name = "AGENTRT_TEST_RESOLVE_ENV_KEY_1234";
        std::env::set_var(var_name, "env-secret-value");
        let auth = AuthConfig {
            env: Some(var_name.into()),
            ..Default::default()
        };
        let result = resolve_api_key(&auth).unwrap();
        assert_eq!(result, "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn resolve_api_key_env_var_missing() {
        let auth = AuthConfig {
            env: Some("AGENTRT_TEST_NONEXISTENT_VAR_8888".into()),
            ..Default::default()
        };
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("AGENTRT_TEST_NONEXISTENT_VAR_8888"));
    }

    #[test]
    fn resolve_api_key_no_config() {
        let auth = AuthConfig::default();
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("no API key configured"));
    }

    #[test]
    fn resolve_api_key_plaintext_takes_precedence_over_env() {
        let auth = AuthConfig {
            key: Some("plaintext-wins".into()),
            env: Some("AGENTRT_TEST_SHOULD_NOT_BE_READ".into()),
        };
        let result = resolve_api_key(&auth).unwrap();
        assert_eq!(result, "plaintext-wins");
    }
}
