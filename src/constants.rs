/// Label key selecting which operator instance owns a `Database` resource
pub const OPERATOR_LABEL: &str = "bonsai-oss.org/external-db-operator";

/// Name advertised to backends in connection metadata
pub const APPLICATION_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
