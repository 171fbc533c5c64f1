//! Actor identification.
//!
//! Authentication happens in front of this service; the identity provider
//! forwards the authenticated user id in the `x-actor-id` header. Every
//! mutating endpoint takes an [`Actor`] so ledger rows and audit fields record
//! who performed the change.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Header carrying the authenticated user id
pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: i32,
}

impl Actor {
    pub fn new(id: i32) -> Self {
        Self { id }
    }

    /// Label used in free-text loan notes.
    pub fn label(&self) -> String {
        format!("user {}", self.id)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {} header", ACTOR_HEADER)))?
            .to_str()
            .map_err(|_| ServiceError::Unauthorized(format!("invalid {} header", ACTOR_HEADER)))?;

        let id = raw
            .trim()
            .parse::<i32>()
            .map_err(|_| ServiceError::Unauthorized(format!("invalid {} header", ACTOR_HEADER)))?;

        Ok(Actor { id })
    }
}
