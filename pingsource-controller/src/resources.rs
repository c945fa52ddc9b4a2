//! Desired state of every object managed on behalf of a PingSource. Pure,
//! computed fresh on every reconcile and never persisted.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
            PodTemplateSpec, ResourceRequirements, ServiceAccount,
        },
        rbac::v1::{RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
    },
};
use kube::{Resource, ResourceExt};
use pingsource_controller_apis::PingSource;
use url::Url;

use crate::errors::ControllerError;

pub(crate) const SOURCE_LABEL: &'static str = "eventing.knative.dev/source";
pub(crate) const SOURCE_NAME_LABEL: &'static str = "eventing.knative.dev/sourceName";
pub(crate) const ROLE_LABEL: &'static str = "sources.knative.dev/role";
pub(crate) const CONTROLLER_AGENT_NAME: &'static str = "ping-source-controller";

/// Name of the shared deployment and of its service account.
pub(crate) const MT_ADAPTER_NAME: &'static str = "pingsource-mt-adapter";
/// Pre-existing ClusterRole granted to per-source adapters.
pub(crate) const ADAPTER_CLUSTER_ROLE: &'static str = "knative-eventing-pingsource-adapter";

const METRICS_PORT: i32 = 9090;

/// Label selector matching every object this controller manages.
pub(crate) fn managed_selector() -> String {
    format!("{}={}", SOURCE_LABEL, CONTROLLER_AGENT_NAME)
}

pub(crate) fn labels(source_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_LABEL.to_string(), CONTROLLER_AGENT_NAME.to_string()),
        (SOURCE_NAME_LABEL.to_string(), source_name.to_string()),
    ])
}

pub(crate) fn mt_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_LABEL.to_string(), CONTROLLER_AGENT_NAME.to_string()),
        (ROLE_LABEL.to_string(), "adapter".to_string()),
    ])
}

fn owner_reference(source: &PingSource) -> Result<OwnerReference, ControllerError> {
    source
        .controller_owner_ref(&())
        .ok_or(ControllerError::MissingObjectKey(".metadata.uid"))
}

fn owned_meta(source: &PingSource, name: &str) -> Result<ObjectMeta, ControllerError> {
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: source.namespace(),
        labels: Some(labels(&source.name_any())),
        owner_references: Some(vec![owner_reference(source)?]),
        ..Default::default()
    })
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

fn metrics_port() -> ContainerPort {
    ContainerPort {
        name: Some("metrics".to_string()),
        container_port: METRICS_PORT,
        ..Default::default()
    }
}

pub(crate) fn make_service_account(
    source: &PingSource,
    name: &str,
) -> Result<ServiceAccount, ControllerError> {
    Ok(ServiceAccount {
        metadata: owned_meta(source, name)?,
        ..Default::default()
    })
}

/// Binds the per-source service account `name` to `cluster_role`.
pub(crate) fn make_role_binding(
    source: &PingSource,
    name: &str,
    cluster_role: &str,
) -> Result<RoleBinding, ControllerError> {
    Ok(RoleBinding {
        metadata: owned_meta(source, name)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: None,
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: source.namespace(),
        }]),
    })
}

pub(crate) struct ReceiveAdapterArgs<'a> {
    pub image: &'a str,
    pub source: &'a PingSource,
    pub name: &'a str,
    pub sink_uri: &'a Url,
    pub logging_config: &'a str,
    pub metrics_config: &'a str,
}

/// The dedicated adapter of a resource scoped PingSource.
pub(crate) fn make_receive_adapter(
    args: &ReceiveAdapterArgs,
) -> Result<Deployment, ControllerError> {
    let source = args.source;
    let labels = labels(&source.name_any());
    let mut vars = vec![
        env("SCHEDULE", &source.spec.schedule),
        env("DATA", source.spec.json_data.as_deref().unwrap_or("")),
        env("K_SINK", args.sink_uri.as_str()),
        env("NAME", &source.name_any()),
        env("NAMESPACE", &source.namespace().unwrap_or_default()),
    ];
    if let Some(overrides) = &source.spec.ce_overrides {
        vars.push(env_var_json("K_CE_OVERRIDES", overrides)?);
    }
    vars.push(env("K_LOGGING_CONFIG", args.logging_config));
    vars.push(env("K_METRICS_CONFIG", args.metrics_config));

    Ok(Deployment {
        metadata: owned_meta(source, args.name)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        "sidecar.istio.io/inject".to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(args.name.to_string()),
                    containers: vec![Container {
                        name: "receive-adapter".to_string(),
                        image: Some(args.image.to_string()),
                        env: Some(vars),
                        ports: Some(vec![metrics_port()]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn env_var_json<T: serde::Serialize>(name: &str, value: &T) -> Result<EnvVar, ControllerError> {
    Ok(env(name, &serde_json::to_string(value)?))
}

pub(crate) struct MtAdapterArgs<'a> {
    pub namespace: &'a str,
    pub image: &'a str,
    pub metrics_domain: &'a str,
    pub logging_config: &'a str,
    pub metrics_config: &'a str,
    pub leader_election_config: &'a str,
}

/// The single adapter serving all cluster scoped PingSources. Built from
/// static configuration only and not owned by any PingSource.
pub(crate) fn make_mt_receive_adapter(args: &MtAdapterArgs) -> Deployment {
    let labels = mt_labels();
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(MT_ADAPTER_NAME.to_string()),
            namespace: Some(args.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(MT_ADAPTER_NAME.to_string()),
                    containers: vec![Container {
                        name: "dispatcher".to_string(),
                        image: Some(args.image.to_string()),
                        env: Some(vec![
                            env_from_field("SYSTEM_NAMESPACE", "metadata.namespace"),
                            env_from_field("NAMESPACE", "metadata.namespace"),
                            env_from_field("POD_NAME", "metadata.name"),
                            env("METRICS_DOMAIN", args.metrics_domain),
                            env("K_LOGGING_CONFIG", args.logging_config),
                            env("K_METRICS_CONFIG", args.metrics_config),
                            env("K_LEADER_ELECTION_CONFIG", args.leader_election_config),
                        ]),
                        ports: Some(vec![metrics_port()]),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities("125m", "64Mi")),
                            limits: Some(quantities("1", "2Gi")),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
