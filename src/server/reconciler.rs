use eyre::WrapErr;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    client::Client,
    ResourceExt,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::watch::{Event, EventKind};
use crate::{
    metrics,
    provider::{self, ConnectionInfo, Provider},
};

/// Single consumer of the watch event stream
///
/// All backend DDL and all secret mutations happen here, so operations on a
/// resource are totally ordered by event arrival and need no locking.
pub struct Reconciler {
    client: Client,
    provider: Arc<dyn Provider>,
    secret_prefix: String,
    events: UnboundedReceiver<Event>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        provider: Arc<dyn Provider>,
        secret_prefix: String,
        events: UnboundedReceiver<Event>,
    ) -> Self {
        Reconciler {
            client,
            provider,
            secret_prefix,
            events,
        }
    }

    /// Apply events until the channel closes or the secret path breaks
    pub async fn run(mut self) -> eyre::Result<()> {
        while let Some(event) = self.events.recv().await {
            let timer = metrics::EVENT_PROCESSING
                .with_label_values(&[event.kind.as_label()])
                .start_timer();

            match self.handle_event(&event).await {
                Ok(()) => {}
                Err(error) if error.is_fatal() => {
                    return Err(error).wrap_err("reconciliation cannot continue safely");
                }
                Err(error) => error!(%error, "failed to reconcile event, awaiting the next one"),
            }

            timer.observe_duration();
        }

        debug!("event channel closed");
        Ok(())
    }

    #[instrument(
        skip_all,
        fields(
            kind = event.kind.as_label(),
            namespace = %event.resource.namespace().unwrap_or_default(),
            resource = %event.resource.name_any(),
        )
    )]
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let resource = &event.resource;
        let namespace = resource.namespace().ok_or(Error::NoNamespace)?;
        let database_name = resource.assemble_database_name();
        let secret_name = secret_name(&self.secret_prefix, &resource.name_any());

        let connection = self.provider.connection_info()?;

        let secrets = Api::<Secret>::namespaced(self.client.clone(), &namespace);
        let existing = match secrets.get(&secret_name).await {
            Ok(secret) => Some(secret),
            Err(error) if is_not_found(&error) => None,
            Err(error) => return Err(Error::Kubernetes(error)),
        };

        // the published secret is the authoritative password store, a fresh
        // password only applies while no secret exists yet
        let password = match &existing {
            Some(secret) => existing_password(secret)?,
            None => generate_password(),
        };
        let data = assemble_secret_data(&database_name, &password, &connection);

        match event.kind {
            EventKind::Added | EventKind::Modified => {
                self.provider.apply(&database_name, &password).await?;
                self.publish_secret(&secrets, &namespace, &secret_name, data, existing)
                    .await?;
            }
            EventKind::Deleted => {
                self.provider.destroy(&database_name).await?;
                self.delete_secret(&secrets, &namespace, &secret_name).await?;
            }
        }

        Ok(())
    }

    async fn publish_secret(
        &self,
        secrets: &Api<Secret>,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        existing: Option<Secret>,
    ) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                // carried over for optimistic concurrency on replace
                resource_version: existing
                    .as_ref()
                    .and_then(|secret| secret.metadata.resource_version.clone()),
                ..Default::default()
            },
            string_data: Some(data),
            type_: Some(String::from("Opaque")),
            ..Default::default()
        };

        if existing.is_none() {
            info!(name, namespace, "creating secret");
            secrets.create(&PostParams::default(), &secret).await?;
        } else {
            info!(name, namespace, "updating secret");
            secrets.replace(name, &PostParams::default(), &secret).await?;
        }

        Ok(())
    }

    async fn delete_secret(&self, secrets: &Api<Secret>, namespace: &str, name: &str) -> Result<()> {
        info!(name, namespace, "deleting secret");
        match secrets.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(Error::Kubernetes(error)),
        }
    }
}

fn secret_name(prefix: &str, resource_name: &str) -> String {
    format!("{prefix}-{resource_name}")
}

/// A fresh password for a database user, constrained to the UUID alphabet so
/// it survives interpolation into DDL
fn generate_password() -> String {
    Uuid::new_v4().to_string()
}

/// The credential fields published for a database and its server
fn assemble_secret_data(
    database_name: &str,
    password: &str,
    connection: &ConnectionInfo,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (String::from("username"), database_name.to_owned()),
        (String::from("password"), password.to_owned()),
        (String::from("host"), connection.host.clone()),
        (String::from("port"), connection.port.to_string()),
        (String::from("database"), database_name.to_owned()),
    ])
}

/// Read the password of record back from a published secret
///
/// Reads go through `data`; `string_data` is never populated by the API.
fn existing_password(secret: &Secret) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get("password"))
        .ok_or(Error::MissingPassword)?;

    String::from_utf8(bytes.0.clone()).map_err(|_| Error::MissingPassword)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource does not have a namespace")]
    NoNamespace,
    #[error("existing secret does not contain a readable password")]
    MissingPassword,
    #[error(transparent)]
    Provider(#[from] provider::Error),
    #[error(transparent)]
    Kubernetes(#[from] kube::Error),
}

impl Error {
    /// Backend errors are retried by the next event for the resource;
    /// errors on the secret path abort the operator, the secret is the
    /// password of record
    fn is_fatal(&self) -> bool {
        !matches!(self, Error::Provider(_) | Error::NoNamespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::core::ErrorResponse;

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            host: String::from("localhost"),
            port: 5432,
        }
    }

    fn response(code: u16) -> ErrorResponse {
        ErrorResponse {
            status: String::from("Failure"),
            message: String::new(),
            reason: String::new(),
            code,
        }
    }

    #[test]
    fn secret_names_carry_the_prefix() {
        assert_eq!(secret_name("edb", "svc.one"), "edb-svc.one");
    }

    #[test]
    fn secret_data_has_exactly_the_published_fields() {
        let data = assemble_secret_data("team_a_svc_one", "sekret", &connection());

        assert_eq!(
            data.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["database", "host", "password", "port", "username"]
        );
        assert_eq!(data["username"], "team_a_svc_one");
        assert_eq!(data["database"], "team_a_svc_one");
        assert_eq!(data["host"], "localhost");
        assert_eq!(data["port"], "5432");
        assert_eq!(data["password"], "sekret");
    }

    #[test]
    fn existing_passwords_are_preserved_byte_for_byte() {
        let password = "0ecb4233-e53f-44e6-b6c4-43340ec2d84e";
        let secret = Secret {
            data: Some(BTreeMap::from([(
                String::from("password"),
                ByteString(password.as_bytes().to_vec()),
            )])),
            ..Default::default()
        };

        let recovered = existing_password(&secret).unwrap();
        assert_eq!(recovered.as_bytes(), password.as_bytes());

        let data = assemble_secret_data("x_y", &recovered, &connection());
        assert_eq!(data["password"], password);
    }

    #[test]
    fn unreadable_passwords_are_rejected() {
        assert!(matches!(
            existing_password(&Secret::default()),
            Err(Error::MissingPassword)
        ));

        let secret = Secret {
            data: Some(BTreeMap::from([(
                String::from("password"),
                ByteString(vec![0xff, 0xfe]),
            )])),
            ..Default::default()
        };
        assert!(matches!(
            existing_password(&secret),
            Err(Error::MissingPassword)
        ));
    }

    #[test]
    fn generated_passwords_are_uuid_shaped() {
        let password = generate_password();

        assert_eq!(password.len(), 36);
        assert!(password
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn only_missing_secrets_count_as_not_found() {
        assert!(is_not_found(&kube::Error::Api(response(404))));
        assert!(!is_not_found(&kube::Error::Api(response(403))));
    }

    #[test]
    fn backend_errors_are_retried_on_the_next_event() {
        assert!(!Error::Provider(provider::Error::NotInitialized).is_fatal());
        assert!(!Error::NoNamespace.is_fatal());
        assert!(Error::MissingPassword.is_fatal());
        assert!(Error::Kubernetes(kube::Error::Api(response(500))).is_fatal());
    }
}
