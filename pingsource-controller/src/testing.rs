//! In-memory stand-ins for the API server, the sink resolver and the event
//! recorder.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use pingsource_controller_apis::{
    Destination, KReference, PingSource, PingSourceSpec, SCOPE_ANNOTATION,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use crate::{
    cluster::{Lister, ManagedKind, ObjectClient, StatusClient},
    errors::{ControllerError, api_error},
    events::{Notifier, Severity},
    resolver::SinkResolver,
};

pub(crate) fn ping_source(name: &str, uid: &str, scope: Option<&str>) -> PingSource {
    PingSource {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            generation: Some(1),
            annotations: scope
                .map(|s| BTreeMap::from([(SCOPE_ANNOTATION.to_string(), s.to_string())])),
            ..Default::default()
        },
        spec: PingSourceSpec {
            schedule: "*/2 * * * *".to_string(),
            json_data: None,
            sink: Destination {
                reference: Some(KReference {
                    kind: "Service".to_string(),
                    namespace: None,
                    name: "svc1".to_string(),
                    api_version: "v1".to_string(),
                }),
                uri: None,
            },
            ce_overrides: None,
        },
        status: None,
    }
}

pub(crate) fn available(mut deployment: Deployment) -> Deployment {
    deployment.status = Some(DeploymentStatus {
        available_replicas: Some(1),
        conditions: Some(vec![DeploymentCondition {
            type_: "Available".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    deployment
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verb {
    Get,
    Create,
    Replace,
    Delete,
    ReplaceStatus,
}

/// A mutating call that reached the fake API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Write {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String);

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn key_of<K: Resource<DynamicType = ()>>(object: &K) -> Key {
    key::<K>(&object.namespace().unwrap_or_default(), &object.name_any())
}

/// Fields the API server fills in on every deployment write.
fn apply_deployment_defaults(value: &mut Value) {
    if !value["spec"]["template"]["spec"].is_object() {
        return;
    }
    let spec = &mut value["spec"];
    if spec["progressDeadlineSeconds"].is_null() {
        spec["progressDeadlineSeconds"] = json!(600);
    }
    if spec["revisionHistoryLimit"].is_null() {
        spec["revisionHistoryLimit"] = json!(10);
    }
    let pod = &mut spec["template"]["spec"];
    for (field, default) in [
        ("restartPolicy", json!("Always")),
        ("dnsPolicy", json!("ClusterFirst")),
        ("terminationGracePeriodSeconds", json!(30)),
        ("schedulerName", json!("default-scheduler")),
    ] {
        if pod[field].is_null() {
            pod[field] = default;
        }
    }
    if let Some(containers) = pod["containers"].as_array_mut() {
        for container in containers {
            if container["imagePullPolicy"].is_null() {
                container["imagePullPolicy"] = json!("IfNotPresent");
            }
            if container["terminationMessagePath"].is_null() {
                container["terminationMessagePath"] = json!("/dev/termination-log");
            }
            if let Some(ports) = container["ports"].as_array_mut() {
                for port in ports {
                    if port["protocol"].is_null() {
                        port["protocol"] = json!("TCP");
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    /// Present in the store, but not yet seen by the cache.
    hidden: HashSet<Key>,
    writes: Vec<Write>,
    /// Creates refused because the object already existed.
    rejected_creates: Vec<Write>,
    failures: Vec<(Verb, kube::Error)>,
    revision: u64,
}

impl State {
    fn take_failure(&mut self, verb: Verb) -> kube::Result<()> {
        match self.failures.iter().position(|(v, _)| *v == verb) {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn store(&mut self, key: Key, mut value: Value) -> Value {
        self.revision += 1;
        value["metadata"]["resourceVersion"] = json!(self.revision.to_string());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{}", self.revision));
        }
        if key.0 == "Deployment" {
            apply_deployment_defaults(&mut value);
        }
        self.objects.insert(key, value.clone());
        value
    }

    fn record(&mut self, verb: Verb, key: &Key) {
        self.writes.push(Write {
            verb,
            kind: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
        });
    }

    /// Current object, failing like the API server on a stale resourceVersion.
    fn current_for_update(&self, key: &Key, resource_version: Option<String>) -> kube::Result<&Value> {
        let current = self
            .objects
            .get(key)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if current["metadata"]["resourceVersion"] != json!(resource_version) {
            return Err(api_error(409, "Conflict"));
        }
        Ok(current)
    }
}

fn decode<K: DeserializeOwned>(value: Value) -> kube::Result<K> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

/// Authoritative store plus a cache view of it. The cache is consistent
/// except for keys hidden with [`FakeCluster::hide_from_cache`].
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Store `object` as if created by someone else, without logging a write.
    pub fn insert<K>(&self, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let value = serde_json::to_value(object).unwrap();
        let stored = self.state().store(key_of(object), value);
        decode(stored).unwrap()
    }

    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let value = self.state().objects.get(&key::<K>(namespace, name)).cloned();
        value.map(|v| decode(v).unwrap())
    }

    /// Number of stored objects of kind `K`.
    pub fn count<K: Resource<DynamicType = ()>>(&self) -> usize {
        let kind = K::kind(&()).to_string();
        self.state().objects.keys().filter(|k| k.0 == kind).count()
    }

    /// A change made by another actor, bumps the resourceVersion.
    pub fn mutate<K: Resource<DynamicType = ()>>(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut Value),
    ) {
        let mut state = self.state();
        let key = key::<K>(namespace, name);
        let mut value = state.objects.get(&key).cloned().unwrap();
        f(&mut value);
        state.store(key, value);
    }

    pub fn make_available(&self, namespace: &str, name: &str) {
        self.mutate::<Deployment>(namespace, name, |d| {
            d["status"] = json!({
                "availableReplicas": 1,
                "conditions": [{"type": "Available", "status": "True"}],
            });
        });
    }

    pub fn hide_from_cache<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) {
        self.state().hidden.insert(key::<K>(namespace, name));
    }

    pub fn fail_next(&self, verb: Verb, error: kube::Error) {
        self.state().failures.push((verb, error));
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn rejected_creates(&self) -> Vec<Write> {
        self.state().rejected_creates.clone()
    }

    fn get_now<K: ManagedKind>(&self, namespace: &str, name: &str) -> kube::Result<K> {
        let mut state = self.state();
        state.take_failure(Verb::Get)?;
        let value = state
            .objects
            .get(&key::<K>(namespace, name))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        decode(value)
    }

    fn create_now<K: ManagedKind>(&self, object: &K) -> kube::Result<K> {
        let mut state = self.state();
        state.take_failure(Verb::Create)?;
        let key = key_of(object);
        if state.objects.contains_key(&key) {
            state.rejected_creates.push(Write {
                verb: Verb::Create,
                kind: key.0.clone(),
                namespace: key.1.clone(),
                name: key.2.clone(),
            });
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        value["metadata"]["uid"] = Value::Null;
        let stored = state.store(key.clone(), value);
        state.record(Verb::Create, &key);
        decode(stored)
    }

    fn replace_now<K: ManagedKind>(&self, object: &K) -> kube::Result<K> {
        let mut state = self.state();
        state.take_failure(Verb::Replace)?;
        let key = key_of(object);
        let current = state.current_for_update(&key, object.resource_version())?;
        let status = current["status"].clone();
        let uid = current["metadata"]["uid"].clone();
        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        value["status"] = status;
        value["metadata"]["uid"] = uid;
        let stored = state.store(key.clone(), value);
        state.record(Verb::Replace, &key);
        decode(stored)
    }

    fn delete_now<K: ManagedKind>(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let mut state = self.state();
        state.take_failure(Verb::Delete)?;
        let key = key::<K>(namespace, name);
        if state.objects.remove(&key).is_none() {
            return Err(api_error(404, "NotFound"));
        }
        state.record(Verb::Delete, &key);
        Ok(())
    }

    /// Like the status sub-resource, only `.status` is taken from `object`
    /// and it replaces the stored status as a whole.
    fn replace_status_now(&self, object: &PingSource) -> kube::Result<PingSource> {
        let mut state = self.state();
        state.take_failure(Verb::ReplaceStatus)?;
        let key = key_of(object);
        let mut value = state
            .current_for_update(&key, object.resource_version())?
            .clone();
        value["status"] = serde_json::to_value(&object.status).map_err(kube::Error::SerdeError)?;
        let stored = state.store(key.clone(), value);
        state.record(Verb::ReplaceStatus, &key);
        decode(stored)
    }
}

impl<K: ManagedKind> Lister<K> for FakeCluster {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let state = self.state();
        let key = key::<K>(namespace, name);
        if state.hidden.contains(&key) {
            return None;
        }
        let value = state.objects.get(&key).cloned()?;
        Some(Arc::new(decode(value).unwrap()))
    }
}

// Every call yields once first, so reconciles joined on one task interleave
// between reading the cache and writing.
impl<K: ManagedKind> ObjectClient<K> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> kube::Result<K> {
        tokio::task::yield_now().await;
        self.get_now(namespace, name)
    }

    async fn create(&self, object: &K) -> kube::Result<K> {
        tokio::task::yield_now().await;
        self.create_now(object)
    }

    async fn replace(&self, object: &K) -> kube::Result<K> {
        tokio::task::yield_now().await;
        self.replace_now(object)
    }

    async fn delete(&self, namespace: &str, name: &str) -> kube::Result<()> {
        tokio::task::yield_now().await;
        self.delete_now::<K>(namespace, name)
    }
}

impl StatusClient<PingSource> for FakeCluster {
    async fn replace_status(&self, object: &PingSource) -> kube::Result<PingSource> {
        tokio::task::yield_now().await;
        self.replace_status_now(object)
    }
}

/// Resolves every destination to the same result and records the requests.
pub(crate) struct FakeResolver {
    result: Mutex<Result<Url, String>>,
    requested: Mutex<Vec<Destination>>,
}

impl FakeResolver {
    pub fn new(url: &str) -> Self {
        Self {
            result: Mutex::new(Ok(Url::parse(url).unwrap())),
            requested: Mutex::default(),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Mutex::new(Err(reason.to_string())),
            requested: Mutex::default(),
        }
    }

    /// Every later resolution fails with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.result.lock().unwrap() = Err(reason.to_string());
    }

    pub fn requested(&self) -> Vec<Destination> {
        self.requested.lock().unwrap().clone()
    }

    fn resolve_now(&self, destination: &Destination) -> Result<Url, ControllerError> {
        self.requested.lock().unwrap().push(destination.clone());
        self.result
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| ControllerError::Any(anyhow::anyhow!(reason)))
    }
}

impl SinkResolver for FakeResolver {
    async fn uri_from_destination(
        &self,
        destination: &Destination,
        _parent: &PingSource,
    ) -> Result<Url, ControllerError> {
        self.resolve_now(destination)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordedEvent {
    pub severity: Severity,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    fn record(&self, severity: Severity, reason: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            note,
        });
    }
}

impl Notifier for RecordingNotifier {
    async fn emit(&self, _source: &PingSource, severity: Severity, reason: &str, note: String) {
        self.record(severity, reason, note);
    }
}
