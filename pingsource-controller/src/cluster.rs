//! Read (cache) and write (API server) access to the objects managed by the
//! reconciler. The cache may lag behind, all writes go to the API server.

use std::{fmt::Debug, future::Future, sync::Arc};

use k8s_openapi::{
    NamespaceResourceScope,
    api::{apps::v1::Deployment, core::v1::ServiceAccount, rbac::v1::RoleBinding},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, PostParams},
};
use kube_runtime::reflector::{ObjectRef, Store};
use pingsource_controller_apis::PingSource;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{MANAGER, errors::ControllerError};

/// A namespaced Kubernetes kind reconciled by [`crate::ensure::ensure`].
pub(crate) trait ManagedKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The fields this controller owns, compared for drift. `Null` means
    /// nothing beyond existence and ownership is reconciled.
    fn owned_fields(&self) -> Result<Value, ControllerError> {
        Ok(Value::Null)
    }

    /// Overwrite the owned fields of `self` with the ones of `desired`.
    fn adopt_owned_fields(&mut self, _desired: &Self) {}
}

impl ManagedKind for ServiceAccount {}

impl ManagedKind for RoleBinding {}

impl ManagedKind for Deployment {
    fn owned_fields(&self) -> Result<Value, ControllerError> {
        let template = self.spec.as_ref().map(|s| &s.template);
        Ok(serde_json::to_value(template)?)
    }

    /// Template labels and annotations are merged, the pod spec replaced.
    fn adopt_owned_fields(&mut self, desired: &Self) {
        let Some(template) = desired.spec.as_ref().map(|s| s.template.clone()) else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.template.spec = template.spec;
        if let Some(desired_meta) = template.metadata {
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            if let Some(labels) = desired_meta.labels {
                meta.labels.get_or_insert_with(Default::default).extend(labels);
            }
            if let Some(annotations) = desired_meta.annotations {
                meta.annotations
                    .get_or_insert_with(Default::default)
                    .extend(annotations);
            }
        }
    }
}

/// Cached, possibly stale, reads.
pub(crate) trait Lister<K> {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
}

/// Strongly consistent reads and writes against the API server.
pub(crate) trait ObjectClient<K> {
    fn get(&self, namespace: &str, name: &str) -> impl Future<Output = kube::Result<K>> + Send;
    fn create(&self, object: &K) -> impl Future<Output = kube::Result<K>> + Send;
    /// Replace guarded by the object's `resourceVersion`.
    fn replace(&self, object: &K) -> impl Future<Output = kube::Result<K>> + Send;
    fn delete(&self, namespace: &str, name: &str) -> impl Future<Output = kube::Result<()>> + Send;
}

/// Writes to the status sub-resource.
pub(crate) trait StatusClient<K> {
    /// Replace the whole status of `object`, guarded by its `resourceVersion`.
    /// Fields missing from the status are cleared on the server.
    fn replace_status(&self, object: &K) -> impl Future<Output = kube::Result<K>> + Send;
}

/// Everything the reconciler reads and writes.
pub(crate) trait Cluster:
    Lister<ServiceAccount>
    + Lister<RoleBinding>
    + Lister<Deployment>
    + ObjectClient<ServiceAccount>
    + ObjectClient<RoleBinding>
    + ObjectClient<Deployment>
    + StatusClient<PingSource>
    + Send
    + Sync
{
}

impl<T> Cluster for T where
    T: Lister<ServiceAccount>
        + Lister<RoleBinding>
        + Lister<Deployment>
        + ObjectClient<ServiceAccount>
        + ObjectClient<RoleBinding>
        + ObjectClient<Deployment>
        + StatusClient<PingSource>
        + Send
        + Sync
{
}

/// [`Cluster`] backed by reflector stores and the Kubernetes API.
#[derive(Clone)]
pub(crate) struct KubeCluster {
    client: Client,
    service_accounts: Store<ServiceAccount>,
    role_bindings: Store<RoleBinding>,
    deployments: Store<Deployment>,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        service_accounts: Store<ServiceAccount>,
        role_bindings: Store<RoleBinding>,
        deployments: Store<Deployment>,
    ) -> Self {
        Self {
            client,
            service_accounts,
            role_bindings,
            deployments,
        }
    }

    fn namespaced_api<K: ManagedKind>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    let mut pp = PostParams::default();
    pp.field_manager = Some(MANAGER.to_string());
    pp
}

impl Lister<ServiceAccount> for KubeCluster {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<ServiceAccount>> {
        self.service_accounts
            .get(&ObjectRef::new(name).within(namespace))
    }
}

impl Lister<RoleBinding> for KubeCluster {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<RoleBinding>> {
        self.role_bindings.get(&ObjectRef::new(name).within(namespace))
    }
}

impl Lister<Deployment> for KubeCluster {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.get(&ObjectRef::new(name).within(namespace))
    }
}

impl<K: ManagedKind> ObjectClient<K> for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> kube::Result<K> {
        self.namespaced_api::<K>(namespace).get(name).await
    }

    async fn create(&self, object: &K) -> kube::Result<K> {
        let namespace = object.namespace().unwrap_or_default();
        self.namespaced_api::<K>(&namespace)
            .create(&post_params(), object)
            .await
    }

    async fn replace(&self, object: &K) -> kube::Result<K> {
        let namespace = object.namespace().unwrap_or_default();
        self.namespaced_api::<K>(&namespace)
            .replace(&object.name_any(), &post_params(), object)
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.namespaced_api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }
}

impl StatusClient<PingSource> for KubeCluster {
    async fn replace_status(&self, object: &PingSource) -> kube::Result<PingSource> {
        let namespace = object.namespace().unwrap_or_default();
        let api: Api<PingSource> = Api::namespaced(self.client.clone(), &namespace);
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        api.replace_status(
            &object.name_any(),
            &pp,
            serde_json::to_vec(object).map_err(kube::Error::SerdeError)?,
        )
        .await
    }
}
