//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Shortest accepted HS256 secret.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer. `env:VAR_NAME` reads it
    /// from the environment.
    pub jwt_secret: Option<String>,

    /// Allowed CORS origins. Empty disables cross-origin access.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        match self.resolve_jwt_secret()? {
            None => Err(ConfigValidationError::MissingJwtSecret),
            Some(secret) if secret.len() < MIN_SECRET_LEN => {
                Err(ConfigValidationError::JwtSecretTooShort)
            }
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    MissingJwtSecret,
    /// Shorter than 32 characters.
    JwtSecretTooShort,
    /// Referenced via `env:VAR_NAME` but unset.
    EnvVarNotFound(String),
    EnvVarEmpty(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingJwtSecret => {
                write!(
                    f,
                    "JWT secret is required. Set auth.jwt_secret in config or OPENV__AUTH__JWT_SECRET."
                )
            }
            Self::JwtSecretTooShort => {
                write!(
                    f,
                    "JWT secret must be at least {} characters long.",
                    MIN_SECRET_LEN
                )
            }
            Self::EnvVarNotFound(var) => {
                write!(
                    f,
                    "Environment variable '{}' not found (referenced via env:{} in config).",
                    var, var
                )
            }
            Self::EnvVarEmpty(var) => {
                write!(
                    f,
                    "Environment variable '{}' is empty (referenced via env:{} in config).",
                    var, var
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret(secret: &str) -> AuthConfig {
        AuthConfig {
            jwt_secret: Some(secret.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_has_no_secret() {
        let config = AuthConfig::default();
        assert!(config.jwt_secret.is_none());
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::MissingJwtSecret)
        );
    }

    #[test]
    fn test_secret_length() {
        assert_eq!(
            with_secret("short").validate(),
            Err(ConfigValidationError::JwtSecretTooShort)
        );
        assert!(with_secret(&"x".repeat(32)).validate().is_ok());
    }

    #[test]
    fn test_env_secret_missing() {
        let config = with_secret("env:OPENV_TEST_SECRET_THAT_IS_NEVER_SET");
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::EnvVarNotFound(
                "OPENV_TEST_SECRET_THAT_IS_NEVER_SET".to_string()
            ))
        );
    }
}
