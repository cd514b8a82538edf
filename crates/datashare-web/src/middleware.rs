use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        HeaderValue, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use datashare_common::types::User;
use tracing::{debug, warn};

use crate::{handlers::ApiError, router::WebState, types::AuthMode};

/// Puts the acting [`User`] into the request extensions.
pub async fn resolve_user(
    State(state): State<Arc<WebState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let user = match state.config.auth {
        AuthMode::Local => state.config.local_user(),
        AuthMode::Basic => match authenticate(&state, basic_credentials(&req)).await {
            Ok(Some(user)) => user,
            Ok(None) => return unauthorized(),
            Err(err) => return err.into_response(),
        },
    };

    req.extensions_mut().insert(user);
    next.run(req).await
}

async fn authenticate(
    state: &WebState,
    credentials: Option<(String, String)>,
) -> Result<Option<User>, ApiError> {
    let Some((login, password)) = credentials else {
        return Ok(None);
    };

    match state.sessions.find_with_password(&login, &password).await {
        Ok(Some(record)) => Ok(Some(record.to_user())),
        Ok(None) => {
            debug!(login = %login, "basic authentication rejected");
            Ok(None)
        }
        Err(err) => {
            warn!(login = %login, error = %err, "session lookup failed");
            Err(ApiError(err))
        }
    }
}

fn basic_credentials(req: &Request) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({
            "code": "Unauthorized",
            "message": "authentication required",
        })),
    )
        .into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"datashare\""),
    );
    response
}
