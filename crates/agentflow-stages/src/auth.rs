//! Credentials for the Anthropic API
//!
//! Two sources are supported:
//! 1. Claude Code OAuth token (CLAUDE_CODE_OAUTH_TOKEN), sent as a bearer token
//! 2. An API key read from the configured variable (ANTHROPIC_API_KEY by default)

use agentflow_core::{FlowError, Result};
use std::env;

/// Environment variable holding a Claude Code OAuth token
pub const OAUTH_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// How requests authenticate
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    OAuth(String),
}

impl Credential {
    /// Header name and value carrying this credential
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Self::ApiKey(key) => ("x-api-key", key.clone()),
            Self::OAuth(token) => ("authorization", format!("Bearer {}", token)),
        }
    }
}

// Never print secrets
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "Credential::ApiKey(***)"),
            Self::OAuth(_) => write!(f, "Credential::OAuth(***)"),
        }
    }
}

/// Resolve a credential from the environment
///
/// Priority:
/// 1. CLAUDE_CODE_OAUTH_TOKEN
/// 2. the variable named by `api_key_env`
///
/// Empty values are ignored.
pub fn resolve_credential(api_key_env: &str) -> Result<Credential> {
    if let Some(token) = non_empty(OAUTH_TOKEN_ENV) {
        tracing::info!("Using Claude Code OAuth token");
        return Ok(Credential::OAuth(token));
    }

    if let Some(key) = non_empty(api_key_env) {
        tracing::info!("Using API key from {}", api_key_env);
        return Ok(Credential::ApiKey(key));
    }

    Err(FlowError::Auth(format!(
        "No credentials found. Set either:\n\
         - {}=sk-ant-oat01-... (OAuth)\n\
         - {}=sk-ant-api03-... (API key)",
        OAUTH_TOKEN_ENV, api_key_env
    )))
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes env var mutation across tests
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const TEST_KEY_ENV: &str = "AGENTFLOW_TEST_API_KEY";

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let result = f();

        for (key, original) in originals {
            match original {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        result
    }

    #[test]
    fn test_oauth_token_wins() {
        with_env_vars(
            &[(OAUTH_TOKEN_ENV, Some("oauth")), (TEST_KEY_ENV, Some("key"))],
            || {
                let cred = resolve_credential(TEST_KEY_ENV).unwrap();
                assert_eq!(cred, Credential::OAuth("oauth".into()));
                assert_eq!(cred.header(), ("authorization", "Bearer oauth".to_string()));
            },
        );
    }

    #[test]
    fn test_configured_key_fallback() {
        with_env_vars(&[(OAUTH_TOKEN_ENV, Some("  ")), (TEST_KEY_ENV, Some("key"))], || {
            let cred = resolve_credential(TEST_KEY_ENV).unwrap();
            assert_eq!(cred.header(), ("x-api-key", "key".to_string()));
        });
    }

    #[test]
    fn test_missing_credentials() {
        with_env_vars(&[(OAUTH_TOKEN_ENV, None), (TEST_KEY_ENV, None)], || {
            let err = resolve_credential(TEST_KEY_ENV).unwrap_err();
            assert!(matches!(err, FlowError::Auth(_)));
            assert!(err.to_string().contains(TEST_KEY_ENV));
        });
    }

    #[test]
    fn test_debug_hides_secret() {
        let cred = Credential::ApiKey("sk-ant-secret".into());
        assert!(!format!("{:?}", cred).contains("secret"));
    }
}
