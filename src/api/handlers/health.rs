//! Health endpoint.

use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

use crate::GIT_COMMIT_HASH;

/// Handle to whatever backs the stores: a pool when Postgres is configured,
/// nothing for the in-memory default.
#[derive(Clone, Default)]
pub struct DatastoreHandle {
    pool: Option<PgPool>,
}

impl DatastoreHandle {
    #[must_use]
    pub fn memory() -> Self {
        Self { pool: None }
    }

    #[must_use]
    pub fn postgres(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Ping the datastore; the in-memory store is always healthy.
    async fn check(&self) -> Result<&'static str, &'static str> {
        let Some(pool) = &self.pool else {
            return Ok("memory");
        };
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        match pool.acquire().instrument(acquire_span).await {
            Ok(mut conn) => {
                let ping_span =
                    info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
                match conn.ping().instrument(ping_span).await {
                    Ok(()) => Ok("ok"),
                    Err(err) => {
                        error!("failed to ping database: {err}");
                        Err("error")
                    }
                }
            }
            Err(err) => {
                error!("failed to acquire database connection: {err}");
                Err("error")
            }
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    datastore: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service and datastore are healthy", body = Health),
        (status = 503, description = "Datastore is unhealthy", body = Health)
    ),
    tag = "health"
)]
pub async fn health(datastore: Extension<DatastoreHandle>) -> impl IntoResponse {
    let result = datastore.check().await;
    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        datastore: match result {
            Ok(status) | Err(status) => status.to_string(),
        },
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };
    let mut headers = HeaderMap::new();
    if let Ok(value) =
        format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>()
    {
        headers.insert("X-App", value);
    }

    if result.is_ok() {
        debug!("datastore is healthy");
        (StatusCode::OK, headers, Json(health))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, Json(health))
    }
}
