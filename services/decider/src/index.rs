use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Comma-separated publish patterns granted beyond the namespace default.
pub const PUB_SUBJECTS_ANNOTATION: &str = "nats.io/allowed-pub-subjects";
/// Comma-separated subscribe patterns granted beyond the namespace default.
pub const SUB_SUBJECTS_ANNOTATION: &str = "nats.io/allowed-sub-subjects";

/// Subject grants computed for one ServiceAccount. The first element of each
/// list is always the `{namespace}.>` isolation default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

/// Cluster-wide map from `namespace/name` to the ServiceAccount's subject
/// grants, kept eventually consistent by a watch.
///
/// Reads never block on the API server and never fail; a ServiceAccount the
/// watch has not delivered yet simply is not found. Writes are serialized by
/// the exclusive lock, so a read always observes a complete entry.
pub struct ServiceAccountIndex {
    entries: RwLock<HashMap<String, PermissionSet>>,
    ready: watch::Sender<bool>,
}

impl ServiceAccountIndex {
    pub fn new() -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ready,
        })
    }

    /// Non-blocking lookup of the grants for `namespace/name`.
    pub fn permissions(&self, namespace: &str, name: &str) -> Option<PermissionSet> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    /// Blocks until the initial list completes, or returns `false` if the
    /// shutdown signal fires first.
    pub async fn await_ready(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut ready = self.ready.subscribe();
        loop {
            if *ready.borrow() {
                return true;
            }
            if *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    }

    /// Starts the cluster-wide watch. List-then-watch and reconnect backoff
    /// are handled by the watcher; this task only folds events into the map.
    pub fn run(
        self: Arc<Self>,
        client: Client,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let api: Api<ServiceAccount> = Api::all(client);
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            let mut stream = std::pin::pin!(stream);

            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.handle_event(event),
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "service account watch error, will retry");
                        }
                        None => {
                            tracing::warn!("service account watch stream ended");
                            return;
                        }
                    },
                    _ = shutdown.changed() => {
                        tracing::debug!("service account watch stopping");
                        return;
                    }
                }
            }
        })
    }

    fn handle_event(&self, event: Event<ServiceAccount>) {
        match event {
            Event::Apply(sa) | Event::InitApply(sa) => self.upsert(&sa),
            Event::Delete(sa) => self.remove(&sa),
            Event::Init => {}
            Event::InitDone => {
                let count = self.entries.read().expect("index lock poisoned").len();
                metrics::gauge!("warden_service_accounts").set(count as f64);
                if !self.ready.send_replace(true) {
                    tracing::info!(count, "service account index synced");
                }
            }
        }
    }

    fn upsert(&self, sa: &ServiceAccount) {
        let Some((key, namespace)) = entry_key(sa) else {
            return;
        };
        let permissions = compose_permissions(&namespace, sa.metadata.annotations.as_ref());
        let mut entries = self.entries.write().expect("index lock poisoned");
        entries.insert(key, permissions);
        metrics::gauge!("warden_service_accounts").set(entries.len() as f64);
    }

    fn remove(&self, sa: &ServiceAccount) {
        let Some((key, _)) = entry_key(sa) else {
            return;
        };
        let mut entries = self.entries.write().expect("index lock poisoned");
        entries.remove(&key);
        metrics::gauge!("warden_service_accounts").set(entries.len() as f64);
    }
}

fn entry_key(sa: &ServiceAccount) -> Option<(String, String)> {
    let namespace = sa.metadata.namespace.as_deref()?;
    let name = sa.metadata.name.as_deref()?;
    Some((format!("{namespace}/{name}"), namespace.to_string()))
}

/// Builds the grant lists for a ServiceAccount: the `{namespace}.>` isolation
/// default first, then annotation patterns with duplicates dropped, keeping
/// first occurrence. Reply inboxes are never granted implicitly.
fn compose_permissions(
    namespace: &str,
    annotations: Option<&BTreeMap<String, String>>,
) -> PermissionSet {
    let default = format!("{namespace}.>");
    let annotated = |key: &str| {
        annotations
            .and_then(|map| map.get(key))
            .map(|value| parse_subject_list(value))
            .unwrap_or_default()
    };

    PermissionSet {
        publish: with_default(&default, annotated(PUB_SUBJECTS_ANNOTATION)),
        subscribe: with_default(&default, annotated(SUB_SUBJECTS_ANNOTATION)),
    }
}

fn with_default(default: &str, patterns: Vec<String>) -> Vec<String> {
    let mut subjects = vec![default.to_string()];
    for pattern in patterns {
        if !subjects.contains(&pattern) {
            subjects.push(pattern);
        }
    }
    subjects
}

/// Splits a comma-separated annotation value into trimmed, non-empty subject
/// patterns. Never fails: an unusable value just contributes nothing.
fn parse_subject_list(value: &str) -> Vec<String> {
    let subjects: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .map(str::to_string)
        .collect();
    if subjects.is_empty() && !value.trim().is_empty() {
        tracing::debug!(value = %value, "annotation yielded no subject patterns");
    }
    subjects
}
