pub(crate) mod admin;
pub(crate) mod health;

pub use admin::{AdminState, AuthConfig};
pub use health::DatastoreHandle;
