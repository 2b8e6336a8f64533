use crate::{
    auth::jwt::{HostAccess, JwtHostTokenService},
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{FromRequestParts, Path, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

/// Require a host token scoped to the `{webinar_id}` in the request path.
///
/// Inserts [`HostAccess`] into request extensions on success.
pub async fn require_host_auth(
    State(jwt_service): State<Arc<JwtHostTokenService>>,
    request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token.to_owned(),
        None => return unauthorized_response("missing bearer token"),
    };

    let access = match jwt_service.validate_host_token(&token) {
        Ok(access) => access,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    let (mut request, webinar_id) = match extract_webinar_id(request).await {
        Some(result) => result,
        None => return forbidden_response(),
    };
    if access.webinar_id != webinar_id {
        return forbidden_response();
    }

    request.extensions_mut().insert(access);
    next.run(request).await
}

async fn extract_webinar_id(request: Request) -> Option<(Request, Uuid)> {
    let (mut parts, body) = request.into_parts();
    let Path(path_params) =
        Path::<HashMap<String, String>>::from_request_parts(&mut parts, &()).await.ok()?;
    let webinar_id = path_params.get("webinar_id").and_then(|raw| Uuid::parse_str(raw).ok())?;

    Some((Request::from_parts(parts, body), webinar_id))
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

fn forbidden_response() -> Response {
    RelayError::new(ErrorCode::AuthForbidden, "host token is not valid for this webinar")
        .into_response()
}
