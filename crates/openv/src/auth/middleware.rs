//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{HeaderMap, Uri, header::AUTHORIZATION, header::COOKIE, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::warn;
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};

/// Cookie consulted when no Authorization header is present.
const AUTH_COOKIE: &str = "auth_token";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Find the request's token. Priority: `Authorization: Bearer`, the
/// `auth_token` cookie, then the `token` query parameter (browsers cannot set
/// headers on WebSocket upgrades).
pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        return bearer_token_from_header(header).map(str::to_string);
    }

    let cookie_token = headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, AUTH_COOKIE));
    if let Some(token) = cookie_token {
        return Ok(token.to_string());
    }

    uri.query()
        .and_then(token_from_query)
        .ok_or(AuthError::MissingAuthHeader)
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear(); // Allow missing iss/aud

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Validate a token and return the tenant it speaks for.
    pub fn authenticate(&self, token: &str) -> Result<i64, AuthError> {
        self.validate_token(token)?.tenant_id()
    }

    /// Issue a token for a tenant. Used by `openv token` and tests.
    pub fn generate_token(&self, tenant_id: i64, ttl_seconds: i64) -> Result<String, AuthError> {
        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: tenant_id.to_string(),
            iss: Some("openv".to_string()),
            aud: None,
            exp: now + ttl_seconds,
            iat: Some(now),
            nbf: None,
            jti: None,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated tenant extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub claims: Claims,
    tenant_id: i64,
}

impl CurrentUser {
    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates the token (see [`request_token`]) and injects `CurrentUser`
/// into request extensions.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = request_token(req.headers(), req.uri())?;
    let claims = auth.validate_token(&token)?;
    let tenant_id = claims.tenant_id()?;

    req.extensions_mut().insert(CurrentUser { claims, tenant_id });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn state() -> AuthState {
        AuthState::new(AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
        assert_eq!(
            bearer_token_from_header("   Bearer\tmixed-case ").unwrap(),
            "mixed-case"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        let cases = [
            "",
            "Bearer",
            "Bearer ",
            "Token something",
            "Bearer token extra",
            "bear token",
        ];

        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_request_token_priority() {
        let uri: Uri = "/ws/terminal/1?token=from%2Dquery".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(request_token(&headers, &uri).unwrap(), "from-query");

        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; auth_token=from-cookie"));
        assert_eq!(request_token(&headers, &uri).unwrap(), "from-cookie");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(request_token(&headers, &uri).unwrap(), "from-header");

        let bare: Uri = "/projects".parse().unwrap();
        assert!(matches!(
            request_token(&HeaderMap::new(), &bare),
            Err(AuthError::MissingAuthHeader)
        ));
    }

    #[test]
    fn test_generate_and_validate_token() {
        let state = state();
        let token = state.generate_token(7, 3600).unwrap();
        assert_eq!(state.authenticate(&token).unwrap(), 7);
    }

    #[test]
    fn test_expired_and_foreign_tokens_rejected() {
        let state = state();
        let expired = state.generate_token(7, -3600).unwrap();
        assert!(matches!(
            state.validate_token(&expired),
            Err(AuthError::TokenExpired)
        ));

        let other = AuthState::new(AuthConfig {
            jwt_secret: Some("another-secret-that-is-also-32-characters".to_string()),
            ..Default::default()
        });
        let foreign = other.generate_token(7, 3600).unwrap();
        assert!(matches!(
            state.validate_token(&foreign),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_no_secret_is_internal_error() {
        let state = AuthState::new(AuthConfig::default());
        assert!(matches!(
            state.validate_token("a.b.c"),
            Err(AuthError::Internal(_))
        ));
    }
}
