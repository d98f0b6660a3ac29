//! Token verification collaborator.
//!
//! The router and upgrader consume the [`Authenticator`] trait; the
//! HMAC-signed JWT implementation lives here. Tokens arrive either in
//! `Authorization: Bearer <jwt>` or as the value of
//! `Sec-WebSocket-Protocol` (bare token or a protocol list with a leading
//! `bearer` entry).

use crate::error::AuthError;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Verified identity extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,
}

/// JWT claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub session_id: String,
    pub iss: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// Validates a presented token into an [`Identity`].
pub trait Authenticator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HMAC (HS256) JWT verification.
pub struct JwtAuthenticator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: String,
    expiry_secs: u64,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8], issuer: &str, expiry_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.validate_nbf = true;

        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
            expiry_secs,
        }
    }

    /// Mint a token for a user/device pair.
    pub fn sign(&self, user_id: &str, device_id: &str) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            exp: now + self.expiry_secs as i64,
            iat: Some(now),
            nbf: Some(now),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl Authenticator for JwtAuthenticator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.user_id.is_empty() {
            return Err(AuthError::MissingUserId);
        }

        Ok(Identity {
            user_id: claims.user_id,
            device_id: claims.device_id,
            session_id: claims.session_id,
        })
    }
}

/// Extract a bearer token from the upgrade request headers.
///
/// `Authorization: Bearer <jwt>` wins; `Sec-WebSocket-Protocol` is the
/// fallback and may hold either the bare token or a protocol list such as
/// `bearer, <jwt>`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    let protocols = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())?;

    protocols
        .split(',')
        .map(str::trim)
        .map(|p| p.strip_prefix("Bearer ").unwrap_or(p))
        .filter(|p| !p.eq_ignore_ascii_case("bearer"))
        .find(|p| !p.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(b"test-secret", "ws-gateway", 3600)
    }

    #[test]
    fn sign_then_validate_round_trip() {
        let auth = authenticator();
        let token = auth.sign("u1", "d1").unwrap();
        let identity = auth.validate(&token).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.device_id, "d1");
        assert!(!identity.session_id.is_empty());
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = authenticator().sign("u1", "d1").unwrap();
        let other = JwtAuthenticator::new(b"other-secret", "ws-gateway", 3600);
        assert!(matches!(
            other.validate(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn rejects_wrong_issuer() {
        let foreign = JwtAuthenticator::new(b"test-secret", "someone-else", 3600);
        let token = foreign.sign("u1", "d1").unwrap();
        assert!(matches!(
            authenticator().validate(&token),
            Err(AuthError::InvalidIssuer)
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let auth = authenticator();
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: "u1".into(),
            device_id: "d1".into(),
            session_id: "s1".into(),
            iss: "ws-gateway".into(),
            exp: now - 600,
            iat: Some(now - 7200),
            nbf: Some(now - 7200),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(auth.validate(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_missing_user_id() {
        let auth = authenticator();
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: String::new(),
            device_id: "d1".into(),
            session_id: "s1".into(),
            iss: "ws-gateway".into(),
            exp: now + 600,
            iat: Some(now),
            nbf: Some(now),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            auth.validate(&token),
            Err(AuthError::MissingUserId)
        ));
    }

    #[test]
    fn token_from_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn token_from_protocol_header_bare_and_listed() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", HeaderValue::from_static("abc.def.ghi"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));

        let mut headers = HeaderMap::new();
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_static("bearer, abc.def.ghi"),
        );
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn missing_token_is_none() {
        assert!(token_from_headers(&HeaderMap::new()).is_none());
    }
}
