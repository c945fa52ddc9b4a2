#[macro_use]
extern crate log;

use anyhow::anyhow;
use futures::{Future, StreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, ServiceAccount},
    rbac::v1::RoleBinding,
};
use kube::{Api, Client, Resource};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use kube_runtime::{
    WatchStreamExt,
    reflector::{Store, reflector, store::Writer},
    watcher::{self, watcher},
};
use pingsource_controller_apis::PingSource;
use prometheus_exporter::start_prometheus_metrics_server;
use serde::de::DeserializeOwned;
use std::{collections::HashSet, fmt::Debug, sync::Arc};

mod cluster;
mod config_store;
mod drift;
mod ensure;
mod errors;
mod events;
mod naming;
mod ping_source_controller;
mod ping_source_modifications;
mod prometheus_exporter;
mod reconciler;
mod resolver;
mod resources;
mod scope;
mod status;
#[cfg(test)]
mod testing;
mod tracker;
mod utils;

use cluster::KubeCluster;
use config_store::ConfigStore;
use events::EventRecorder;
use ping_source_controller::PingSourceController;
use reconciler::{Reconciler, ReconcilerSettings};
use resolver::UriResolver;
use resources::managed_selector;
use tracker::DeploymentTracker;

/// The K8s field manager name, also the reporting controller of events.
const MANAGER: &'static str = "pingsource-controller";

#[derive(Clone)]
struct Configuration {
    ping_sources: Api<PingSource>,
    watch_namespaces: Option<HashSet<String>>,
    settings: ReconcilerSettings,
    cluster_domain: String,
    config_logging_name: String,
    config_observability_name: String,
    pod_name: Option<String>,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        fn required(name: &str) -> anyhow::Result<String> {
            env_var(name).ok_or_else(|| anyhow!("environment variable {} must be set", name))
        }
        let watch_namespaces: Option<HashSet<String>> = env_var("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let mut tmp = watch_namespaces.iter().flatten();
        let ping_sources = if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching PingSources in namespace {}", ns);
            Api::<PingSource>::namespaced(client, ns.as_str())
        } else {
            if let Some(namespaces) = &watch_namespaces {
                let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                info!(
                    "Controller is watching PingSources in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching PingSources in all namespaces");
            }
            Api::<PingSource>::all(client)
        };
        let migrate_deprecated_names = env_var("MIGRATE_DEPRECATED_NAMES")
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| anyhow!("invalid MIGRATE_DEPRECATED_NAMES: {}", e))?
            .unwrap_or(true);
        let settings = ReconcilerSettings {
            adapter_image: required("RA_IMAGE")?,
            mt_adapter_image: required("MT_RA_IMAGE")?,
            system_namespace: env_var("SYSTEM_NAMESPACE")
                .unwrap_or_else(|| "knative-eventing".to_string()),
            leader_election_config: env_var("K_LEADER_ELECTION_CONFIG")
                .unwrap_or_else(|| "{}".to_string()),
            metrics_domain: env_var("METRICS_DOMAIN")
                .unwrap_or_else(|| "knative.dev/eventing".to_string()),
            migrate_deprecated_names,
        };
        Ok(Configuration {
            ping_sources,
            watch_namespaces,
            settings,
            cluster_domain: env_var("CLUSTER_DOMAIN").unwrap_or_else(|| "cluster.local".to_string()),
            config_logging_name: env_var("CONFIG_LOGGING_NAME")
                .unwrap_or_else(|| "config-logging".to_string()),
            config_observability_name: env_var("CONFIG_OBSERVABILITY_NAME")
                .unwrap_or_else(|| "config-observability".to_string()),
            pod_name: env_var("POD_NAME"),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Cache of `K` objects matching `config`, kept current by the returned future.
fn lister<K>(api: Api<K>, config: watcher::Config) -> (Store<K>, impl Future<Output = ()>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let writer: Writer<K> = Default::default();
    let store = writer.as_reader();
    let reflector = reflector(writer, watcher(api, config))
        .default_backoff()
        .applied_objects()
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!("watch of {} failed: {}", K::kind(&()), e);
            }
        });
    (store, reflector)
}

/// Feed every version of the named ConfigMap into `store`.
fn watch_config_map(
    api: Api<ConfigMap>,
    name: &str,
    store: Arc<ConfigStore>,
    update: fn(&ConfigStore, &ConfigMap),
) -> impl Future<Output = ()> {
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    watcher(api, config)
        .default_backoff()
        .applied_objects()
        .for_each(move |res| {
            let store = store.clone();
            async move {
                match res {
                    Ok(cm) => update(&store, &cm),
                    Err(e) => warn!("watch of ConfigMap failed: {}", e),
                }
            }
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install the rustls crypto provider"))?;

    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider);
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client.clone())?;
    let system_namespace = configuration.settings.system_namespace.clone();

    let managed = watcher::Config::default().labels(&managed_selector());
    let (service_accounts, service_account_reflector) =
        lister(Api::<ServiceAccount>::all(client.clone()), managed.clone());
    let (role_bindings, role_binding_reflector) =
        lister(Api::<RoleBinding>::all(client.clone()), managed.clone());
    let (deployments, deployment_reflector) =
        lister(Api::<Deployment>::all(client.clone()), managed);

    let config_store = Arc::new(ConfigStore::new(&configuration.settings.metrics_domain));
    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), &system_namespace);
    let logging_watch = watch_config_map(
        config_maps.clone(),
        &configuration.config_logging_name,
        config_store.clone(),
        ConfigStore::update_from_logging_config_map,
    );
    let observability_watch = watch_config_map(
        config_maps,
        &configuration.config_observability_name,
        config_store.clone(),
        ConfigStore::update_from_metrics_config_map,
    );

    let tracker = DeploymentTracker::default();
    let reconciler = Reconciler::new(
        KubeCluster::new(client.clone(), service_accounts, role_bindings, deployments),
        UriResolver::new(client.clone(), &configuration.cluster_domain),
        tracker.clone(),
        EventRecorder::new(client.clone(), MANAGER, configuration.pod_name.clone()),
        config_store,
        configuration.settings.clone(),
    );
    let controller = PingSourceController::new(
        reconciler,
        tracker,
        configuration.watch_namespaces.clone(),
    )
    .start(configuration.ping_sources.clone(), client, &system_namespace);

    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       _ = service_account_reflector => (),
       _ = role_binding_reflector => (),
       _ = deployment_reflector => (),
       _ = logging_watch => (),
       _ = observability_watch => (),
       res = prometheus_metrics_exporter => res?,
    };
    Ok(())
}
