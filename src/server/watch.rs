use eyre::WrapErr;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent},
    client::Client,
    ResourceExt,
};
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::{debug, info, warn};

use crate::resources::Database;

/// Upper bound on consecutive undecodable events before the watch is
/// declared broken and the process terminates
const MAX_CONSECUTIVE_EMPTY: u32 = 10;

/// A single resource mutation delivered by the watch
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub resource: Database,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    /// The Kubernetes wire spelling, also used as the metric label value
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::Added => "ADDED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
        }
    }
}

/// Produces the ordered event stream consumed by the reconciler
///
/// Watches `Database` resources across all namespaces, scoped by the
/// instance label selector. The stream is re-established from the last seen
/// resource version whenever the server closes it.
pub struct Watcher {
    api: Api<Database>,
    params: ListParams,
    events: UnboundedSender<Event>,
}

impl Watcher {
    pub fn new(client: Client, selector: String, events: UnboundedSender<Event>) -> Self {
        Watcher {
            api: Api::all(client),
            params: ListParams::default().labels(&selector).timeout(290),
            events,
        }
    }

    /// Watch until the stop signal fires, the reconciler goes away, or the
    /// stream turns pathological
    pub async fn run(self, mut stop: oneshot::Receiver<()>) -> eyre::Result<()> {
        let mut resource_version = String::from("0");
        let mut empty_events = EmptyEvents::default();

        loop {
            let mut stream = self
                .api
                .watch(&self.params, &resource_version)
                .await
                .wrap_err("failed to open watch")?
                .boxed();

            loop {
                let item = tokio::select! {
                    _ = &mut stop => {
                        debug!("shutdown signal received");
                        return Ok(());
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };

                match item {
                    Ok(WatchEvent::Added(resource)) => {
                        empty_events.reset();
                        resource_version = resource.resource_version().unwrap_or(resource_version);
                        if !self.dispatch(EventKind::Added, resource) {
                            return Ok(());
                        }
                    }
                    Ok(WatchEvent::Modified(resource)) => {
                        empty_events.reset();
                        resource_version = resource.resource_version().unwrap_or(resource_version);
                        if !self.dispatch(EventKind::Modified, resource) {
                            return Ok(());
                        }
                    }
                    Ok(WatchEvent::Deleted(resource)) => {
                        empty_events.reset();
                        resource_version = resource.resource_version().unwrap_or(resource_version);
                        if !self.dispatch(EventKind::Deleted, resource) {
                            return Ok(());
                        }
                    }
                    Ok(WatchEvent::Bookmark(bookmark)) => {
                        empty_events.reset();
                        resource_version = bookmark.metadata.resource_version;
                    }
                    Ok(WatchEvent::Error(response)) => {
                        empty_events.reset();
                        warn!(
                            code = response.code,
                            message = %response.message,
                            "watch produced an error event"
                        );

                        // our resource version has been compacted away,
                        // replay current state from scratch
                        if response.code == 410 {
                            resource_version = String::from("0");
                            break;
                        }
                    }
                    // the api server delivers undecodable events while the
                    // resource definition changes under the watch
                    Err(kube::Error::SerdeError(error)) => {
                        debug!(%error, "discarding undecodable event");
                        empty_events.record()?;
                    }
                    Err(error) => {
                        warn!(%error, "watch stream failed, re-establishing");
                        break;
                    }
                }
            }

            debug!(%resource_version, "watch stream closed, reopening");
        }
    }

    /// Forward an event to the reconciler, in arrival order; returns false
    /// once the consuming side has shut down
    fn dispatch(&self, kind: EventKind, resource: Database) -> bool {
        debug!(
            kind = kind.as_label(),
            resource = %resource.name_any(),
            "dispatching event"
        );

        let delivered = self.events.send(Event { kind, resource }).is_ok();
        if !delivered {
            info!("event channel closed, stopping watch");
        }

        delivered
    }
}

/// Tracks consecutive empty deliveries; a long run means the watched
/// resource definition no longer matches what this operator expects
#[derive(Debug, Default)]
struct EmptyEvents {
    consecutive: u32,
}

impl EmptyEvents {
    fn record(&mut self) -> Result<(), EmptyEventOverflow> {
        self.consecutive += 1;

        if self.consecutive > MAX_CONSECUTIVE_EMPTY {
            Err(EmptyEventOverflow)
        } else {
            Ok(())
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("received more than 10 consecutive empty events, the watched resource definition is likely broken")]
pub struct EmptyEventOverflow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_events_overflow_past_the_limit() {
        let mut counter = EmptyEvents::default();

        for _ in 0..MAX_CONSECUTIVE_EMPTY {
            counter.record().unwrap();
        }

        assert!(counter.record().is_err());
    }

    #[test]
    fn decoded_events_reset_the_counter() {
        let mut counter = EmptyEvents::default();

        for _ in 0..MAX_CONSECUTIVE_EMPTY {
            counter.record().unwrap();
        }
        counter.reset();

        assert!(counter.record().is_ok());
    }

    #[test]
    fn labels_use_the_wire_spelling() {
        assert_eq!(EventKind::Added.as_label(), "ADDED");
        assert_eq!(EventKind::Modified.as_label(), "MODIFIED");
        assert_eq!(EventKind::Deleted.as_label(), "DELETED");
    }

    #[test]
    fn watch_lines_decode_into_resources() {
        let line = r#"{
            "type": "ADDED",
            "object": {
                "apiVersion": "bonsai-oss.org/v1",
                "kind": "Database",
                "metadata": {"name": "svc.one", "namespace": "team-a", "resourceVersion": "12"},
                "spec": {}
            }
        }"#;

        let event: WatchEvent<Database> = serde_json::from_str(line).unwrap();
        match event {
            WatchEvent::Added(resource) => {
                assert_eq!(resource.assemble_database_name(), "team_a_svc_one");
                assert_eq!(resource.resource_version().as_deref(), Some("12"));
            }
            other => panic!("expected an added event, got {other:?}"),
        }
    }
}
