use async_trait::async_trait;
use std::{collections::BTreeMap, sync::LazyLock};
use url::Url;

mod mysql;
mod postgres;

pub use mysql::MySql;
pub use postgres::Postgres;

/// A database backend capable of provisioning logical databases and users
///
/// Implementations must be idempotent: `apply` tolerates pre-existing
/// objects and `destroy` tolerates missing ones, so that replayed watch
/// events converge instead of failing.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open and configure the underlying connection pool
    async fn initialize(&mut self, dsn: &str) -> Result<()>;

    /// Ensure the database and its owning user exist with the given password
    async fn apply(&self, name: &str, password: &str) -> Result<()>;

    /// Drop the database and user if present
    async fn destroy(&self, name: &str) -> Result<()>;

    /// The server address published into credential secrets
    fn connection_info(&self) -> Result<ConnectionInfo>;

    /// Round-trip probe of the backend connection
    async fn health_check(&self) -> Result<()>;

    /// Release the connection pool at shutdown
    async fn close(&self);
}

/// The backend server address as parsed from the DSN
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
}

type Factory = fn() -> Box<dyn Provider>;

static REGISTRY: LazyLock<BTreeMap<&'static str, Factory>> = LazyLock::new(|| {
    BTreeMap::from([
        ("mysql", mysql::provide as Factory),
        ("postgres", postgres::provide as Factory),
    ])
});

/// Construct the provider registered under the given identifier
pub fn provide(name: &str) -> Result<Box<dyn Provider>> {
    let factory = REGISTRY
        .get(name)
        .ok_or_else(|| Error::UnknownProvider(name.to_owned()))?;

    Ok(factory())
}

fn connection_info_from_dsn(dsn: &str, default_port: u16) -> Result<ConnectionInfo> {
    let url = Url::parse(dsn)?;
    let host = url.host_str().ok_or(Error::MissingHost)?.to_owned();

    Ok(ConnectionInfo {
        host,
        port: url.port().unwrap_or(default_port),
    })
}

/// Whether the server rejected a CREATE because the object already exists
fn is_already_exists(error: &sqlx::Error) -> bool {
    error.to_string().contains("already exists")
}

/// Whether the server rejected a DROP because the object is already gone
fn is_not_exists(error: &sqlx::Error) -> bool {
    error.to_string().contains("does not exist")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no database provider registered as {0:?}")]
    UnknownProvider(String),
    #[error("provider has not been initialized")]
    NotInitialized,
    #[error("dsn does not contain a host")]
    MissingHost,
    #[error(transparent)]
    InvalidDsn(#[from] url::ParseError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_both_dialects() {
        assert!(provide("postgres").is_ok());
        assert!(provide("mysql").is_ok());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let error = provide("oracle").map(|_| ()).unwrap_err();
        assert!(matches!(error, Error::UnknownProvider(name) if name == "oracle"));
    }

    #[test]
    fn dsn_without_host_is_rejected() {
        let error = connection_info_from_dsn("postgres:///tmp/socket", 5432)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(error, Error::MissingHost));
    }
}
