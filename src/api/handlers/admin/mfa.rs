//! MFA management endpoints: enroll, verify, disable, backup codes.
//!
//! All of these require a valid admin session. The verify endpoint sits
//! behind the fixed-window limiter under its own action key, so code guessing
//! is bounded independently of login attempts.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::error;

use super::state::AdminState;
use super::types::{
    BackupCodesResponse, ErrorResponse, MfaCodeRequest, MfaEnableResponse, MfaVerifyResponse,
};
use super::utils::{extract_client_ip, extract_session_token, extract_user_agent};
use crate::mfa::{AttemptContext, MfaError};
use crate::ratelimit::RateLimitAction;
use crate::session::AdminSession;

/// Resolve the session cookie/bearer into a valid admin session, or fail
/// with the status to return.
async fn require_admin_session(
    headers: &HeaderMap,
    state: &AdminState,
) -> Result<AdminSession, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match state.sessions().validate(&token).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("failed to validate session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/mfa/enable",
    responses(
        (status = 200, description = "Enrollment started; secret and backup codes are shown once", body = MfaEnableResponse),
        (status = 401, description = "Missing or invalid session"),
        (status = 409, description = "MFA already enabled", body = ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn enable(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
) -> axum::response::Response {
    let session = match require_admin_session(&headers, &state).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };
    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let ctx = AttemptContext {
        client_ip: client_ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    match state
        .mfa()
        .enable(session.user_id, &session.user_id.to_string(), ctx)
        .await
    {
        Ok(start) => (
            StatusCode::OK,
            Json(MfaEnableResponse {
                secret: start.secret,
                qr_code: start.otpauth_url,
                backup_codes: start.backup_codes,
            }),
        )
            .into_response(),
        Err(MfaError::AlreadyEnrolled) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "MFA already enabled".to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("failed to start MFA enrollment: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/mfa/verify",
    request_body = MfaCodeRequest,
    responses(
        (status = 200, description = "Code accepted", body = MfaVerifyResponse),
        (status = 400, description = "Code rejected", body = MfaVerifyResponse),
        (status = 401, description = "Missing or invalid session"),
        (status = 429, description = "Rate limited", body = ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
    payload: Option<Json<MfaCodeRequest>>,
) -> axum::response::Response {
    let session = match require_admin_session(&headers, &state).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let subject = format!("user:{}", session.user_id);
    match state
        .limiter()
        .acquire(&subject, RateLimitAction::MfaVerify)
        .await
    {
        Ok(status) if !status.allowed => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse {
                    error: "Too many attempts".to_string(),
                }),
            )
                .into_response();
        }
        Ok(_) => {}
        Err(err) => {
            error!("rate limiter unavailable: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let ctx = AttemptContext {
        client_ip: client_ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    match state.mfa().verify(session.user_id, &request.code, ctx).await {
        Ok(_) => (
            StatusCode::OK,
            Json(MfaVerifyResponse {
                success: true,
                error: None,
            }),
        )
            .into_response(),
        Err(MfaError::InvalidCode | MfaError::NotEnrolled | MfaError::AlreadyEnrolled) => (
            StatusCode::BAD_REQUEST,
            Json(MfaVerifyResponse {
                success: false,
                error: Some("Invalid code".to_string()),
            }),
        )
            .into_response(),
        Err(MfaError::Unavailable(err)) => {
            error!("MFA verification unavailable: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/mfa/disable",
    request_body = MfaCodeRequest,
    responses(
        (status = 200, description = "MFA disabled", body = MfaVerifyResponse),
        (status = 400, description = "Code rejected or MFA not enabled", body = MfaVerifyResponse),
        (status = 401, description = "Missing or invalid session"),
    ),
    tag = "admin"
)]
pub async fn disable(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
    payload: Option<Json<MfaCodeRequest>>,
) -> axum::response::Response {
    let session = match require_admin_session(&headers, &state).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let ctx = AttemptContext {
        client_ip: client_ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    match state.mfa().disable(session.user_id, &request.code, ctx).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MfaVerifyResponse {
                success: true,
                error: None,
            }),
        )
            .into_response(),
        Err(MfaError::InvalidCode | MfaError::NotEnrolled | MfaError::AlreadyEnrolled) => (
            StatusCode::BAD_REQUEST,
            Json(MfaVerifyResponse {
                success: false,
                error: Some("Invalid code".to_string()),
            }),
        )
            .into_response(),
        Err(MfaError::Unavailable(err)) => {
            error!("MFA disable unavailable: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/mfa/backup-codes",
    responses(
        (status = 200, description = "Fresh backup codes; the previous set is invalid", body = BackupCodesResponse),
        (status = 400, description = "MFA not enabled", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session"),
    ),
    tag = "admin"
)]
pub async fn backup_codes(
    headers: HeaderMap,
    state: Extension<Arc<AdminState>>,
) -> axum::response::Response {
    let session = match require_admin_session(&headers, &state).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let ctx = AttemptContext {
        client_ip: client_ip.as_deref(),
        user_agent: user_agent.as_deref(),
    };

    match state
        .mfa()
        .regenerate_backup_codes(session.user_id, ctx)
        .await
    {
        Ok(codes) => (
            StatusCode::OK,
            Json(BackupCodesResponse {
                backup_codes: codes,
            }),
        )
            .into_response(),
        Err(MfaError::NotEnrolled | MfaError::AlreadyEnrolled | MfaError::InvalidCode) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "MFA is not enabled".to_string(),
            }),
        )
            .into_response(),
        Err(MfaError::Unavailable(err)) => {
            error!("backup code regeneration unavailable: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
