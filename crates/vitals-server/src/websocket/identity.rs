//! Verified caller identity, as forwarded by the upstream auth layer.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use metrics::counter;
use tracing::debug;

/// Header carrying the verified user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the display name. Falls back to the user id.
pub const USERNAME_HEADER: &str = "x-username";

/// Identity of the caller. Trusted as given; verification happens upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name.
    pub username: String,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };

        let Some(user_id) = header(USER_ID_HEADER) else {
            debug!("rejecting upgrade without identity");
            counter!(crate::metrics::WS_UNAUTHENTICATED_TOTAL).increment(1);
            return Err((StatusCode::UNAUTHORIZED, "missing authenticated identity"));
        };
        let username = header(USERNAME_HEADER).unwrap_or_else(|| user_id.clone());
        Ok(Self { user_id, username })
    }
}
