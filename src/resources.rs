use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A logical database on the configured backend server, together with a
/// dedicated user and a published credential secret.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "bonsai-oss.org",
    version = "v1",
    kind = "Database",
    singular = "database",
    plural = "databases",
    shortname = "db",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Reserved for a future override of the derived database name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Database {
    /// The name used for both the logical database and its user on the
    /// backend, derived from the resource's namespace and name
    pub fn assemble_database_name(&self) -> String {
        let namespace = self.namespace().unwrap_or_default();
        sanitize(&format!("{namespace}_{}", self.name_any()))
    }
}

/// Collapse every run of characters that are illegal in database identifiers
/// into a single underscore
pub fn sanitize(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut in_run = false;

    for character in input.chars() {
        if character == '.' || character == '-' {
            if !in_run {
                output.push('_');
            }
            in_run = true;
        } else {
            output.push(character);
            in_run = false;
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(namespace: &str, name: &str) -> Database {
        let mut database = Database::new(name, DatabaseSpec { database: None });
        database.metadata.namespace = Some(namespace.to_owned());
        database
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize("team-a_svc.one"), "team_a_svc_one");
        assert_eq!(sanitize("a._-b"), "a_b");
        assert_eq!(sanitize("plain_name"), "plain_name");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["team-a_svc.one", "a._-b", "x--y..z", "already_clean"] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn assembled_name_is_deterministic() {
        let first = resource("team-a", "svc.one");
        let second = resource("team-a", "svc.one");

        assert_eq!(first.assemble_database_name(), "team_a_svc_one");
        assert_eq!(
            first.assemble_database_name(),
            second.assemble_database_name()
        );
    }

    #[test]
    fn definition_targets_expected_group() {
        use kube::CustomResourceExt;

        let definition = Database::crd();
        assert_eq!(definition.spec.group, "bonsai-oss.org");
        assert_eq!(definition.spec.names.plural, "databases");
        assert_eq!(definition.spec.scope, "Namespaced");
    }
}
