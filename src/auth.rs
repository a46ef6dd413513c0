//! Bearer-token authentication (HS256 JWT)

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Authentication failures, all answered with 401
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Caller identity carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,

    #[serde(default)]
    pub role: String,

    /// Expiry, seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    pub fn new(sub: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            role: role.into(),
            exp: None,
        }
    }

    pub fn expires_at(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Signs and verifies HS256 tokens with a shared secret
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Issue a token for `claims`
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = JwtHeader {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let header = serde_json::to_vec(&header).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let payload = serde_json::to_vec(claims).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Check signature, algorithm and expiry, then return the claims
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let malformed = || AuthError::InvalidToken("malformed token".to_string());

        let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (header, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
        if payload.contains('.') {
            return Err(malformed());
        }

        let header: JwtHeader = decode_json(header)?;
        if header.alg != "HS256" {
            return Err(AuthError::InvalidToken(format!(
                "unexpected signing method: {}",
                header.alg
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken("malformed signature".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken("signature is invalid".to_string()))?;

        let claims: Claims = decode_json(payload)?;
        if let Some(exp) = claims.exp {
            if exp <= chrono::Utc::now().timestamp() {
                return Err(AuthError::InvalidToken("token is expired".to_string()));
            }
        }

        Ok(claims)
    }

    /// Extract and verify the token from an `Authorization` header value
    pub fn authorize(&self, header_value: Option<&str>) -> Result<Claims, AuthError> {
        let value = header_value.ok_or(AuthError::MissingHeader)?;

        let token = match value.trim().split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
                token.trim()
            }
            _ => return Err(AuthError::InvalidFormat),
        };

        self.verify(token)
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::InvalidToken("malformed token".to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Middleware: reject unauthenticated requests, attach [`Claims`] to the rest
pub async fn require_bearer(
    State(verifier): State<Arc<JwtVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|value| value.to_str().map_err(|_| AuthError::InvalidFormat))
        .transpose()?;

    let claims = verifier.authorize(header_value).map_err(|e| {
        warn!(path = %request.uri().path(), error = %e, "Rejected unauthenticated request");
        e
    })?;

    debug!(sub = %claims.sub, role = %claims.role, "Authenticated request");
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
