use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};

use crate::{errors::ApiError, AppState};

pub use crate::services::auth_client::Claims;

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let Authorization(bearer) = headers.typed_get::<Authorization<Bearer>>()?;
    let token = bearer.token().trim();

    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Resolves the bearer token (if any) and stores the `CurrentUser` in request
/// extensions. Requests without a valid token pass through anonymously and
/// are turned away by the handlers that need a user.
pub async fn inject_current_user(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(req.headers()) {
        match state.auth.verify(&token).await {
            Ok(Some(user)) => {
                req.extensions_mut().insert(user);
            }
            Ok(None) => {
                tracing::debug!("bearer token rejected");
            }
            Err(e) => {
                return ApiError::UpstreamUnavailable(e.to_string()).into_response();
            }
        }
    }

    next.run(req).await
}
