//! One reconcile of one PingSource: resolve the sink, converge the adapter
//! objects of its scope and project the outcome onto its status.

use std::sync::Arc;

use kube_runtime::reflector::ObjectRef;
use pingsource_controller_apis::PingSource;
use url::Url;

use crate::{
    cluster::Cluster,
    config_store::{AdapterConfig, ConfigStore},
    ensure::ensure,
    errors::{ControllerError, Outcome},
    events::{Notifier, Severity},
    naming::{deprecated_receive_adapter_name, receive_adapter_name},
    ping_source_modifications::PingSourceModifications,
    resolver::{SinkResolver, resolve_sink},
    resources::{
        ADAPTER_CLUSTER_ROLE, MtAdapterArgs, ReceiveAdapterArgs, make_mt_receive_adapter,
        make_receive_adapter, make_role_binding, make_service_account,
    },
    scope::{Scope, route},
    status::{cloud_event_attributes, propagate_deployment_availability},
    tracker::Tracker,
};

const SERVICE_ACCOUNT_FAILED: &'static str = "PingSourceServiceAccountFailed";
const ROLE_BINDING_FAILED: &'static str = "PingSourceRoleBindingFailed";
const DEPLOYMENT_FAILED: &'static str = "PingSourceDeploymentFailed";

/// Static configuration, fixed for the lifetime of the process.
#[derive(Clone, Debug)]
pub(crate) struct ReconcilerSettings {
    /// Image of per-source adapters.
    pub adapter_image: String,
    /// Image of the shared adapter.
    pub mt_adapter_image: String,
    /// Namespace of the shared adapter.
    pub system_namespace: String,
    pub leader_election_config: String,
    pub metrics_domain: String,
    /// Remove deployments left behind under the previous naming scheme.
    pub migrate_deprecated_names: bool,
}

pub(crate) struct Reconciler<C, R, T, N> {
    cluster: C,
    resolver: R,
    tracker: T,
    notifier: N,
    config: Arc<ConfigStore>,
    settings: ReconcilerSettings,
}

impl<C, R, T, N> Reconciler<C, R, T, N>
where
    C: Cluster,
    R: SinkResolver + Send + Sync,
    T: Tracker + Send + Sync,
    N: Notifier + Send + Sync,
{
    pub fn new(
        cluster: C,
        resolver: R,
        tracker: T,
        notifier: N,
        config: Arc<ConfigStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            cluster,
            resolver,
            tracker,
            notifier,
            config,
            settings,
        }
    }

    /// Steps run strictly in order, a failing step ends the reconcile but
    /// the status observed so far is still written.
    pub async fn reconcile_kind(&self, source: &PingSource) -> Outcome {
        let mut source = PingSourceModifications::new(source.clone());
        let config = self.config.snapshot();
        let result = self.reconcile_source(&mut source, &config).await;

        let attributes = cloud_event_attributes(&source);
        let generation = source.metadata.generation;
        let status = source.status_mut();
        status.set_ce_attributes(attributes);
        status.observed_generation = generation;

        let result = match (result, source.update_status(&self.cluster).await) {
            (Err(e), Err(status_error)) => {
                warn!(
                    "failed to update status of PingSource {}: {}",
                    source.id(),
                    status_error
                );
                Err(e)
            }
            (Err(e), Ok(_)) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(_)) => Ok(()),
        };
        if let Err(e) = &result {
            self.notifier
                .emit(&source, Severity::Warning, e.reason(), e.to_string())
                .await;
        }
        Outcome::from(result)
    }

    async fn reconcile_source(
        &self,
        source: &mut PingSourceModifications,
        config: &AdapterConfig,
    ) -> Result<(), ControllerError> {
        let sink = match resolve_sink(&self.resolver, &source.modified).await {
            Ok(sink) => sink,
            Err(e) => {
                source.status_mut().mark_no_sink("NotFound", e.to_string());
                return Err(e);
            }
        };
        let status = source.status_mut();
        status.mark_sink(sink.as_str());
        status.mark_schedule();

        match route(source) {
            Scope::Cluster => self.reconcile_cluster_scope(source, config).await,
            Scope::Resource => self.reconcile_resource_scope(source, config, &sink).await,
        }
    }

    async fn reconcile_cluster_scope(
        &self,
        source: &mut PingSourceModifications,
        config: &AdapterConfig,
    ) -> Result<(), ControllerError> {
        let desired = make_mt_receive_adapter(&MtAdapterArgs {
            namespace: &self.settings.system_namespace,
            image: &self.settings.mt_adapter_image,
            metrics_domain: &self.settings.metrics_domain,
            logging_config: &config.logging_config,
            metrics_config: &config.metrics_config,
            leader_election_config: &self.settings.leader_election_config,
        });
        let (deployment, _) = ensure(&self.cluster, &self.notifier, &source.modified, desired, None)
            .await
            .map_err(ControllerError::stage(
                DEPLOYMENT_FAILED,
                "Reconciling the shared receive adapter failed",
            ))?;
        propagate_deployment_availability(source.status_mut(), &deployment);
        self.tracker
            .track(ObjectRef::from_obj(&deployment), &source.modified)?;
        Ok(())
    }

    async fn reconcile_resource_scope(
        &self,
        source: &mut PingSourceModifications,
        config: &AdapterConfig,
        sink: &Url,
    ) -> Result<(), ControllerError> {
        self.tracker.untrack(&source.modified);
        let name = receive_adapter_name(&source.modified)?;

        let service_account = make_service_account(&source.modified, &name)?;
        ensure(&self.cluster, &self.notifier, &source.modified, service_account, None)
            .await
            .map_err(ControllerError::stage(
                SERVICE_ACCOUNT_FAILED,
                "Reconciling the receive adapter service account failed",
            ))?;

        let role_binding = make_role_binding(&source.modified, &name, ADAPTER_CLUSTER_ROLE)?;
        ensure(&self.cluster, &self.notifier, &source.modified, role_binding, None)
            .await
            .map_err(ControllerError::stage(
                ROLE_BINDING_FAILED,
                "Reconciling the receive adapter role binding failed",
            ))?;

        let desired = make_receive_adapter(&ReceiveAdapterArgs {
            image: &self.settings.adapter_image,
            source: &source.modified,
            name: &name,
            sink_uri: sink,
            logging_config: &config.logging_config,
            metrics_config: &config.metrics_config,
        })?;
        let deprecated = self.deprecated_name(&source.modified)?;
        let (deployment, _) = ensure(
            &self.cluster,
            &self.notifier,
            &source.modified,
            desired,
            deprecated.as_deref(),
        )
        .await
        .map_err(ControllerError::stage(
            DEPLOYMENT_FAILED,
            "Reconciling the receive adapter failed",
        ))?;
        propagate_deployment_availability(source.status_mut(), &deployment);
        Ok(())
    }

    /// Name of a receive adapter created by older releases, if it should
    /// still be cleaned up.
    fn deprecated_name(&self, source: &PingSource) -> Result<Option<String>, ControllerError> {
        if self.settings.migrate_deprecated_names {
            Ok(Some(deprecated_receive_adapter_name(source)?))
        } else {
            Ok(None)
        }
    }
}
