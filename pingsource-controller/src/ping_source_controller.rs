use crate::{
    cluster::KubeCluster,
    errors::{ControllerError, Outcome},
    events::EventRecorder,
    reconciler::Reconciler,
    resolver::UriResolver,
    resources::{MT_ADAPTER_NAME, managed_selector},
    tracker::DeploymentTracker,
    utils::metric_name,
};

use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ServiceAccount, rbac::v1::RoleBinding};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use pingsource_controller_apis::PingSource;
use std::{collections::HashSet, future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};

const PING_SOURCE_CONTROLLER: &'static str = "ping_source_controller";

/// `None` watches every namespace, "all" markers are already folded into it.
fn is_watched(watch_namespaces: Option<&HashSet<String>>, namespace: &str) -> bool {
    watch_namespaces.map_or(true, |v| v.contains(namespace))
}

pub(crate) type KubeReconciler =
    Reconciler<KubeCluster, UriResolver, DeploymentTracker, EventRecorder>;

/// Drives a [`KubeReconciler`] from PingSource changes and changes of the
/// objects managed on their behalf.
pub(crate) struct PingSourceController {
    reconciler: KubeReconciler,
    /// Shared with the reconciler, maps shared adapter changes to PingSources.
    tracker: DeploymentTracker,
    watch_namespaces: Option<HashSet<String>>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
}

impl PingSourceController {
    pub fn new(
        reconciler: KubeReconciler,
        tracker: DeploymentTracker,
        watch_namespaces: Option<HashSet<String>>,
    ) -> Self {
        let meter: Meter = global::meter(PING_SOURCE_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of PingSource reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of PingSource objects in milliseconds")
            .with_unit("ms")
            .with_boundaries(vec![
                25.0, 50.0, 100.0, 200.0, 400.0, 800.0, 1600.0, 3200.0, 6400.0, 12800.0,
            ])
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocation errors for PingSource resources")
            .build();
        Self {
            reconciler,
            tracker,
            watch_namespaces,
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
        }
    }

    /// Controller triggers this whenever a PingSource or one of its
    /// dependencies changed
    async fn reconcile(object: Arc<PingSource>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let namespace = object.namespace().unwrap_or_default();
        if !is_watched(me.watch_namespaces.as_ref(), &namespace) {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch for PingSource objects",
                object.id()
            );
            return Ok(Action::await_change());
        }
        let start = Instant::now();
        let outcome = me.reconciler.reconcile_kind(&object).await;
        let duration = Instant::now() - start;

        let labels = &[
            KeyValue::new("object_name", object.name_any()),
            KeyValue::new("object_namespace", namespace),
            KeyValue::new("outcome", outcome.label()),
        ];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        match &outcome {
            Outcome::Success => debug!("reconciled PingSource {}", object.id()),
            Outcome::RetryableFailure(e) => {
                warn!("reconcile of PingSource {} failed, will retry: {}", object.id(), e)
            }
            Outcome::TerminalFailure(e) => {
                error!("reconcile of PingSource {} failed: {}", object.id(), e)
            }
        }
        outcome.into_result()?;
        Ok(Action::requeue(Duration::from_secs(3600)))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(_object: Arc<PingSource>, error: &ControllerError, _ctx: Arc<Self>) -> Action {
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::await_change()
        }
    }

    pub fn start(
        self,
        ping_sources: Api<PingSource>,
        client: Client,
        system_namespace: &str,
    ) -> impl Future<Output = ()> {
        let selector = managed_selector();
        let owned = Config::default().labels(&selector);
        let shared_adapter =
            Config::default().fields(&format!("metadata.name={}", MT_ADAPTER_NAME));
        let tracker = self.tracker.clone();
        let reconcile_errors = self.reconcile_errors.clone();
        Controller::new(ping_sources, Config::default())
            .owns(Api::<Deployment>::all(client.clone()), owned.clone())
            .owns(Api::<ServiceAccount>::all(client.clone()), owned.clone())
            .owns(Api::<RoleBinding>::all(client.clone()), owned)
            .watches(
                Api::<Deployment>::namespaced(client, system_namespace),
                shared_adapter,
                move |deployment| tracker.dependents_of(&deployment),
            )
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(move |res| {
                let reconcile_errors = reconcile_errors.clone();
                async move {
                    match res {
                        Ok(o) => debug!("reconciled {:?}", o),
                        Err(e) => match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("reconcile failed: {:?}", a);
                                reconcile_errors.add(1, &[]);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("reconcile failed: {:?}", a);
                            }
                            e => {
                                debug!("reconcile failed: {:?}", e);
                                reconcile_errors.add(1, &[]);
                            }
                        },
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_namespaces_are_watched() {
        assert!(is_watched(None, "default"));
        let namespaces: HashSet<String> = ["ns1".to_string(), "ns2".to_string()].into();
        assert!(is_watched(Some(&namespaces), "ns2"));
        assert!(!is_watched(Some(&namespaces), "default"));
        assert!(!is_watched(Some(&namespaces), ""));
    }
}
