//! Delegated credential verification against the identity provider.
//!
//! Primary email/password checking is not implemented here: the provider is
//! an external collaborator reached over HTTP with a hard timeout. A timeout
//! or transport failure is an error distinct from a rejection, so callers can
//! fail closed without conflating the two.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Typed role hierarchy; variant order is the privilege order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn has_privilege(self, required: Role) -> bool {
        self >= required
    }
}

/// A verified identity as reported by the provider.
#[derive(Clone, Debug, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Provider unreachable, timed out, or answered outside its contract.
    #[error("identity provider unavailable")]
    Unavailable(#[source] anyhow::Error),
}

/// External credential check: `Ok(None)` means the credentials were rejected.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Identity>, IdentityError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    email: &'a str,
    password: &'a str,
}

pub struct HttpIdentityProvider {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpIdentityProvider {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::APP_USER_AGENT)
            .build()?;
        let verify_url = format!(
            "{}/v1/credentials/verify",
            base_url.trim_end_matches('/')
        );
        Ok(Self { client, verify_url })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<Identity>, IdentityError> {
        let request = VerifyRequest {
            email,
            password: password.expose_secret(),
        };
        let response = self
            .client
            .post(&self.verify_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable(err.into()))?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let identity = response
                    .json::<Identity>()
                    .await
                    .map_err(|err| IdentityError::Unavailable(err.into()))?;
                Ok(Some(identity))
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Ok(None),
            status => Err(IdentityError::Unavailable(anyhow::anyhow!(
                "unexpected identity provider status: {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn role_hierarchy_is_ordered() {
        assert!(Role::Admin.has_privilege(Role::Admin));
        assert!(Role::Admin.has_privilege(Role::Staff));
        assert!(Role::Admin.has_privilege(Role::Customer));
        assert!(!Role::Staff.has_privilege(Role::Admin));
        assert!(!Role::Customer.has_privilege(Role::Staff));
    }

    #[test]
    fn role_serde_names_are_snake_case() {
        let value = serde_json::to_value(Role::Admin).unwrap();
        assert_eq!(value, serde_json::json!("admin"));
        let role: Role = serde_json::from_value(serde_json::json!("staff")).unwrap();
        assert_eq!(role, Role::Staff);
    }
}
