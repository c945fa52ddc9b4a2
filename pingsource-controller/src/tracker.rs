//! Subscription table re-triggering PingSources when an object they depend
//! on, but do not own, changes.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use pingsource_controller_apis::PingSource;

use crate::errors::ControllerError;

pub(crate) trait Tracker {
    /// Reconcile `dependent` again whenever `watched` changes.
    fn track(
        &self,
        watched: ObjectRef<Deployment>,
        dependent: &PingSource,
    ) -> Result<(), ControllerError>;

    /// Forget every subscription of `dependent`.
    fn untrack(&self, dependent: &PingSource);
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Deployment> for NamespacedName {
    fn from(o: &Deployment) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_default(),
        }
    }
}

impl From<&PingSource> for NamespacedName {
    fn from(o: &PingSource) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_default(),
        }
    }
}

impl From<&ObjectRef<Deployment>> for NamespacedName {
    fn from(o: &ObjectRef<Deployment>) -> Self {
        Self {
            name: o.name.clone(),
            namespace: o.namespace.clone().unwrap_or_default(),
        }
    }
}

impl NamespacedName {
    pub fn object_ref(&self) -> ObjectRef<PingSource> {
        ObjectRef::new(self.name.as_str()).within(self.namespace.as_str())
    }
}

/// watched deployment -> dependent PingSources
#[derive(Clone, Default)]
pub(crate) struct DeploymentTracker {
    dependents: Arc<RwLock<HashMap<NamespacedName, HashSet<NamespacedName>>>>,
}

impl DeploymentTracker {
    /// PingSources to reconcile after `deployment` changed.
    pub fn dependents_of(&self, deployment: &Deployment) -> Vec<ObjectRef<PingSource>> {
        let guard = self.dependents.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&NamespacedName::from(deployment))
            .map(|sources| sources.iter().map(NamespacedName::object_ref).collect())
            .unwrap_or_default()
    }
}

impl Tracker for DeploymentTracker {
    fn track(
        &self,
        watched: ObjectRef<Deployment>,
        dependent: &PingSource,
    ) -> Result<(), ControllerError> {
        if dependent.metadata.name.is_none() {
            return Err(ControllerError::MissingObjectKey(".metadata.name"));
        }
        let mut guard = self.dependents.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(NamespacedName::from(&watched))
            .or_default()
            .insert(NamespacedName::from(dependent));
        Ok(())
    }

    fn untrack(&self, dependent: &PingSource) {
        let dependent = NamespacedName::from(dependent);
        let mut guard = self.dependents.write().unwrap_or_else(|e| e.into_inner());
        guard.retain(|_, sources| {
            sources.remove(&dependent);
            !sources.is_empty()
        });
    }
}
