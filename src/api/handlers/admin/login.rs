//! Admin login, session validation, and logout endpoints.
//!
//! The handlers translate between HTTP and the orchestrator: cookie
//! transport, header extraction, and the uniform failure bodies live here;
//! the state machine itself knows nothing about HTTP.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::error;

use super::state::AdminState;
use super::types::{
    AdminSessionInfo, ErrorResponse, LoginRequestBody, LoginResponse, LoginUser,
    RateLimitedResponse, SessionStatusResponse,
};
use super::utils::{
    clear_session_cookie, extract_client_ip, extract_session_token, extract_user_agent,
    session_cookie,
};
use crate::login::{LoginError, LoginOutcome, LoginRequest};

#[utoipa::path(
    post,
    path = "/v1/admin/login",
    request_body = LoginRequestBody,
    responses(
        (status = 200, description = "Session issued, or MFA code required", body = LoginResponse),
        (status = 401, description = "Authentication failed", body = ErrorResponse),
        (status = 403, description = "Access denied", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = RateLimitedResponse),
    ),
    tag = "admin"
)]
pub async fn login(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
    payload: Option<Json<LoginRequestBody>>,
) -> axum::response::Response {
    let Some(Json(body)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let request = LoginRequest {
        email: body.email,
        password: SecretString::from(body.password),
        mfa_code: body.mfa_code,
        client_ip: extract_client_ip(&headers),
        user_agent: extract_user_agent(&headers),
    };

    match state.orchestrator().login(request).await {
        Ok(LoginOutcome::MfaRequired) => {
            (StatusCode::OK, Json(LoginResponse::requires_mfa())).into_response()
        }
        Ok(LoginOutcome::Success {
            identity,
            session,
            token,
        }) => {
            let cookie = match session_cookie(state.config(), &token) {
                Ok(cookie) => cookie,
                Err(err) => {
                    error!("failed to build session cookie: {err}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let mut response_headers = HeaderMap::new();
            response_headers.insert(SET_COOKIE, cookie);
            let response = LoginResponse {
                success: true,
                requires_mfa: false,
                user: Some(LoginUser {
                    id: identity.user_id.to_string(),
                    email: identity.email,
                    role: identity.role.as_str().to_string(),
                }),
                admin_session: Some(AdminSessionInfo {
                    id: session.id.to_string(),
                    expires_at: session.expires_at,
                }),
            };
            (StatusCode::OK, response_headers, Json(response)).into_response()
        }
        Err(err) => login_error_response(&err),
    }
}

/// Map a terminal login failure to its status and uniform body.
fn login_error_response(err: &LoginError) -> axum::response::Response {
    match err {
        LoginError::RateLimited { reset_at } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedResponse {
                error: "Too many attempts".to_string(),
                reset_time: *reset_at,
            }),
        )
            .into_response(),
        // Gate failures share one body; the wording never distinguishes them.
        LoginError::IpBlocked | LoginError::InsufficientPrivilege => (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "Access denied".to_string(),
            }),
        )
            .into_response(),
        // Credential-class failures share one body as well.
        LoginError::InvalidCredentials
        | LoginError::InvalidMfaCode
        | LoginError::InvalidOrExpiredSession => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Authentication failed".to_string(),
            }),
        )
            .into_response(),
        LoginError::SessionCreationFailed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Authentication unavailable".to_string(),
            }),
        )
            .into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/session",
    responses(
        (status = 200, description = "Session is valid", body = SessionStatusResponse),
        (status = 401, description = "Missing, invalid, or expired session", body = SessionStatusResponse),
    ),
    tag = "admin"
)]
pub async fn session(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
) -> axum::response::Response {
    let invalid = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(SessionStatusResponse {
                valid: false,
                user_id: None,
                expires_at: None,
            }),
        )
            .into_response()
    };

    let Some(token) = extract_session_token(&headers) else {
        return invalid();
    };
    match state.sessions().validate(&token).await {
        Ok(Some(session)) => (
            StatusCode::OK,
            Json(SessionStatusResponse {
                valid: true,
                user_id: Some(session.user_id.to_string()),
                expires_at: Some(session.expires_at),
            }),
        )
            .into_response(),
        Ok(None) => invalid(),
        Err(err) => {
            error!("failed to validate session: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/logout",
    responses(
        (status = 204, description = "Session revoked and cookie cleared"),
    ),
    tag = "admin"
)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
) -> axum::response::Response {
    if let Some(token) = extract_session_token(&headers) {
        if let Err(err) = state.sessions().terminate(&token).await {
            error!("failed to revoke session: {err}");
        }
    }

    // Always clear the cookie, even when no session record existed.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}
