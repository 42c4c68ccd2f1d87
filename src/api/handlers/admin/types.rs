//! Request/response types for the admin auth endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequestBody {
    pub email: String,
    pub password: String,
    #[serde(default, rename = "mfaCode")]
    pub mfa_code: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginUser {
    pub id: String,
    pub email: String,
    pub role: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AdminSessionInfo {
    pub id: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(rename = "requiresMFA")]
    pub requires_mfa: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<LoginUser>,
    #[serde(rename = "adminSession", skip_serializing_if = "Option::is_none")]
    pub admin_session: Option<AdminSessionInfo>,
}

impl LoginResponse {
    #[must_use]
    pub fn requires_mfa() -> Self {
        Self {
            success: false,
            requires_mfa: true,
            user: None,
            admin_session: None,
        }
    }
}

/// Uniform failure body; the text never names the failing stage.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RateLimitedResponse {
    pub error: String,
    #[serde(rename = "resetTime")]
    pub reset_time: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionStatusResponse {
    pub valid: bool,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaEnableResponse {
    pub secret: String,
    #[serde(rename = "qrCode")]
    pub qr_code: String,
    #[serde(rename = "backupCodes")]
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaCodeRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaVerifyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BackupCodesResponse {
    #[serde(rename = "backupCodes")]
    pub backup_codes: Vec<String>,
}
