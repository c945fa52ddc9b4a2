//! Projection of the observed deployment state onto a PingSource status.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use pingsource_controller_apis::{
    CloudEventAttributes, PING_SOURCE_EVENT_TYPE, PingSource, PingSourceStatus, ping_source_source,
};

/// Mirrors the deployment's own `Available` condition. Without one, any
/// available replica counts.
pub(crate) fn is_available(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let available = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Available");
    match available {
        Some(c) => c.status == "True",
        None => status.available_replicas.unwrap_or(0) > 0,
    }
}

pub(crate) fn propagate_deployment_availability(
    status: &mut PingSourceStatus,
    deployment: &Deployment,
) {
    if is_available(deployment) {
        status.mark_deployed();
    } else {
        status.mark_not_deployed(
            "DeploymentUnavailable",
            format!(
                "The Deployment '{}' is unavailable.",
                deployment.name_any()
            ),
        );
    }
}

/// Always recomputed from the source identity, any previous value is
/// overwritten.
pub(crate) fn cloud_event_attributes(source: &PingSource) -> Vec<CloudEventAttributes> {
    vec![CloudEventAttributes {
        type_: PING_SOURCE_EVENT_TYPE.to_string(),
        source: ping_source_source(
            source.namespace().as_deref().unwrap_or(""),
            &source.name_any(),
        ),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{available, ping_source};
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use pingsource_controller_apis::CONDITION_DEPLOYED;

    #[test]
    fn availability_mirrors_deployment_condition() {
        let mut d = Deployment::default();
        assert!(!is_available(&d));

        d.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        assert!(is_available(&d));

        d.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "False".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!is_available(&d));
        assert!(is_available(&available(Deployment::default())));
    }

    #[test]
    fn unavailable_deployment_marks_not_deployed() {
        let mut status = PingSourceStatus::default();
        let mut d = Deployment::default();
        d.metadata.name = Some("pingsource-mt-adapter".to_string());
        propagate_deployment_availability(&mut status, &d);
        let deployed = status.condition(CONDITION_DEPLOYED).unwrap();
        assert!(deployed.is_false());
        assert_eq!(deployed.reason, "DeploymentUnavailable");

        propagate_deployment_availability(&mut status, &available(d));
        assert!(status.condition(CONDITION_DEPLOYED).unwrap().is_true());
    }

    #[test]
    fn event_attributes_follow_identity() {
        let attributes = cloud_event_attributes(&ping_source("p1", "abc", None));
        assert_eq!(1, attributes.len());
        assert_eq!(attributes[0].type_, "dev.knative.sources.ping");
        assert_eq!(attributes[0].source, "/apis/v1/namespaces/default/pingsources/p1");
    }
}
