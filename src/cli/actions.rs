//! Actions produced by CLI dispatch.

use anyhow::Result;

use crate::api::AuthConfig;

pub struct ServerArgs {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: AuthConfig,
}

pub enum Action {
    Server(Box<ServerArgs>),
}

impl Action {
    /// Execute the selected action.
    ///
    /// # Errors
    /// Propagates server startup and runtime errors.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Server(args) => crate::api::new(args.port, args.dsn, args.auth).await,
        }
    }
}
