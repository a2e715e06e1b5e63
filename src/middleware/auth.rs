//! Identity extraction middleware.
//!
//! Lifts an optional bearer token into a `UserContext` request extension.
//! Absence of a token is not an error here - whether anonymous calls are
//! acceptable is decided per tool by the RBAC gate (strict mode).

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::models::UserContext;
use crate::utils::{ApiError, JwtUtil};

#[derive(Clone)]
pub struct AuthState {
    pub jwt_util: Arc<JwtUtil>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let user_context: Option<UserContext> = match token {
        Some(token) => {
            let claims = state.jwt_util.verify_token(token)?;
            tracing::debug!(
                "Authenticated user {} with roles {:?}",
                claims.sub,
                claims.roles
            );
            Some(UserContext { user_id: claims.sub, roles: claims.roles, org_id: claims.org_id })
        }
        None => None,
    };

    req.extensions_mut().insert(user_context);

    Ok(next.run(req).await)
}
