//! HTTP Basic auth gate for every route of the terminal server.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Basic},
};
use tracing::debug;

use crate::WrapperState;

pub async fn require_basic_auth(
    State(state): State<WrapperState>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.options.credential.as_deref() else {
        return next.run(request).await;
    };

    match auth {
        Some(TypedHeader(Authorization(basic)))
            if credential_matches(expected, basic.username(), basic.password()) =>
        {
            next.run(request).await
        }
        _ => {
            debug!("Rejected unauthenticated request to {}", request.uri().path());
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"tty_wrapper\"")],
            )
                .into_response()
        }
    }
}

/// `expected` is `user:password`; compared without early exit on the secret.
pub fn credential_matches(expected: &str, username: &str, password: &str) -> bool {
    let Some((expected_user, expected_pass)) = expected.split_once(':') else {
        return false;
    };
    let user_ok = constant_time_eq(expected_user.as_bytes(), username.as_bytes());
    let pass_ok = constant_time_eq(expected_pass.as_bytes(), password.as_bytes());
    user_ok & pass_ok
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
