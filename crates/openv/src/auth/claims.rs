//! JWT claims.

use serde::{Deserialize, Serialize};

use super::AuthError;

/// JWT claims structure.
///
/// Registered claims only; `sub` carries the numeric tenant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (tenant id).
    pub sub: String,

    #[serde(default)]
    pub iss: Option<String>,

    #[serde(default)]
    pub aud: Option<Vec<String>>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    #[serde(default)]
    pub iat: Option<i64>,

    #[serde(default)]
    pub nbf: Option<i64>,

    #[serde(default)]
    pub jti: Option<String>,
}

impl Claims {
    /// The tenant this token speaks for.
    pub fn tenant_id(&self) -> Result<i64, AuthError> {
        self.sub
            .trim()
            .parse::<i64>()
            .map_err(|_| AuthError::InvalidSubject(self.sub.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str) -> Claims {
        Claims {
            sub: sub.to_string(),
            iss: None,
            aud: None,
            exp: 0,
            iat: None,
            nbf: None,
            jti: None,
        }
    }

    #[test]
    fn test_tenant_id() {
        assert_eq!(claims("42").tenant_id().unwrap(), 42);
        assert!(matches!(
            claims("alice").tenant_id(),
            Err(AuthError::InvalidSubject(_))
        ));
        assert!(claims("").tenant_id().is_err());
    }

    #[test]
    fn test_identity_claims_are_ignored() {
        let json = r#"{"sub":"7","exp":0,"email":"dev@localhost","name":"Dev"}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.tenant_id().unwrap(), 7);
    }
}
