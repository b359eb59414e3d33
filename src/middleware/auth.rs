//! Bearer-token authentication and scope checks for the admin API.
//!
//! Tokens are HS256 JWTs. A token is bound to one project and, optionally,
//! one environment; a token without an `environment_id` claim may act on any
//! environment of its project.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const SCOPE_WRITE: &str = "deletion:write";
pub const SCOPE_READ: &str = "deletion:read";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: i64,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub project_id: String,
    pub environment_id: Option<String>,
    pub scopes: Vec<String>,
}

/// Scopes have the form `resource:action`. `*` and `resource:*` are wildcards.
pub fn check_scope(scopes: &[String], required_scope: &str) -> bool {
    if scopes.iter().any(|s| s == "*" || s == required_scope) {
        return true;
    }
    match required_scope.split_once(':') {
        Some((resource, _)) => {
            let wildcard = format!("{}:*", resource);
            scopes.iter().any(|s| *s == wildcard)
        }
        None => false,
    }
}

impl Actor {
    /// Check that this actor may use `scope` on the given environment.
    pub fn authorize(&self, project_id: &str, environment_id: &str, scope: &str) -> AppResult<()> {
        let env_ok = self
            .environment_id
            .as_deref()
            .map_or(true, |bound| bound == environment_id);
        if self.project_id != project_id || !env_ok {
            tracing::warn!(
                actor_id = %self.id,
                project_id,
                environment_id,
                "access outside token scope denied"
            );
            return Err(AppError::Forbidden(format!(
                "token is not valid for environment {}/{}",
                project_id, environment_id
            )));
        }
        if !check_scope(&self.scopes, scope) {
            tracing::warn!(actor_id = %self.id, scope, "missing scope");
            return Err(AppError::Forbidden(format!(
                "insufficient scope: '{}' required",
                scope
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait Authenticate: Send + Sync {
    async fn authenticate(&self, token: &str) -> AppResult<Actor>;
}

pub struct JwtAuthenticator {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token. Used by the CLI and tests.
    pub fn issue(&self, claims: &Claims) -> anyhow::Result<String> {
        Ok(encode(&Header::default(), claims, &self.encoding)?)
    }
}

#[async_trait]
impl Authenticate for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> AppResult<Actor> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).map_err(|e| {
            tracing::debug!("bearer token rejected: {}", e);
            AppError::Unauthorized("invalid or expired bearer token".into())
        })?;
        let claims = data.claims;
        Ok(Actor {
            id: claims.sub,
            project_id: claims.project_id,
            environment_id: claims.environment_id,
            scopes: claims.scopes,
        })
    }
}

/// Pull the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))
}
