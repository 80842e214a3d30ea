//! Authentication & RBAC for the control surface.
//!
//! Built around `auth::jwt::JwtHandler` and `auth::middleware::auth_middleware`,
//! trimmed to what the risk control plane's narrow control surface needs: no
//! user registration or password store, since operators are provisioned out
//! of band and only need a bearer token minted by `riskctl issue-token`. The
//! role hierarchy (`Viewer` < `Trader` < `Admin`) mirrors `UserRole` elsewhere
//! in this stack.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Trader,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Trader => "trader",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "viewer" => Some(Role::Viewer),
            "trader" => Some(Role::Trader),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// JWT claims carried by every control-surface token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    pub fn generate_token(&self, subject: &str, role: Role) -> anyhow::Result<(String, usize)> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .ok_or_else(|| anyhow::anyhow!("invalid expiration timestamp"))?
            .timestamp() as usize;
        let claims = Claims {
            sub: subject.to_string(),
            role,
            exp: expiration,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))?;
        Ok((token, (self.expiration_hours * 3600) as usize))
    }

    pub fn validate_token(&self, token: &str) -> anyhow::Result<Claims> {
        let decoded = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &Validation::default())?;
        debug!(subject = %decoded.claims.sub, role = decoded.claims.role.as_str(), "validated control-surface token");
        Ok(decoded.claims)
    }
}

/// Validates the bearer token on every request (query param `token=` is
/// accepted too, for WebSocket upgrades that cannot set headers) and
/// inserts `Claims` into the request extensions for handlers to read.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let from_query = req.uri().query().and_then(|q| {
        q.split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });
    let from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let token = from_query.or(from_header).ok_or(AuthError::MissingToken)?;
    let claims = jwt_handler.validate_token(&token).map_err(|_| AuthError::InvalidToken)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

/// `EmergencyHalt`/`ResumeTrading`/`UpdateRiskLimits`/`AckAlert` check this
/// before acting; read-only routes (`GetRiskStatus`, `GetPositions`, ...)
/// accept any authenticated role.
pub fn has_role(req: &Request, minimum: Role) -> bool {
    extract_claims(req).is_some_and(|c| c.role >= minimum)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid or expired token"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "insufficient role for this operation"),
        };
        (status, message).into_response()
    }
}
