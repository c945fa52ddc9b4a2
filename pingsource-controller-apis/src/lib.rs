use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "sources.knative.dev";

/// Annotation selecting whether a [`PingSource`] is served by the shared
/// (cluster scoped) adapter or gets a dedicated one.
pub const SCOPE_ANNOTATION: &'static str = "eventing.knative.dev/scope";
pub const SCOPE_CLUSTER: &'static str = "cluster";
pub const SCOPE_RESOURCE: &'static str = "resource";

/// CloudEvent type of every event emitted on behalf of a [`PingSource`].
pub const PING_SOURCE_EVENT_TYPE: &'static str = "dev.knative.sources.ping";

pub const CONDITION_READY: &'static str = "Ready";
pub const CONDITION_SINK_PROVIDED: &'static str = "SinkProvided";
pub const CONDITION_VALID_SCHEDULE: &'static str = "ValidSchedule";
pub const CONDITION_DEPLOYED: &'static str = "Deployed";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// Last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Human readable details about the transition, may be empty.
    pub message: String,

    /// The `.metadata.generation` the condition was computed for.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// CamelCase programmatic identifier of the last transition.
    pub reason: String,

    /// One of True, False, Unknown.
    pub status: String,

    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    pub fn is_false(&self) -> bool {
        self.status == "False"
    }
}

/// PingSource delivers a CloudEvent to its sink on a fixed cron schedule.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sources.knative.dev",
    version = "v1alpha2",
    kind = "PingSource",
    derive = "PartialEq",
    status = "PingSourceStatus",
    namespaced,
    shortname = "ping",
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the PingSource adapter is deployed and its sink resolved."
    }"#,
    printcolumn = r#"{
        "name":"Sink",
        "type": "string",
        "jsonPath": ".status.sinkUri",
        "description": "The resolved address events are delivered to."
    }"#,
    printcolumn = r#"{
        "name":"Schedule",
        "type": "string",
        "jsonPath": ".spec.schedule"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct PingSourceSpec {
    /// Cron expression, validated on admission.
    pub schedule: String,
    /// Payload sent with every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_data: Option<String>,
    /// Where events are delivered to.
    pub sink: Destination,
    /// Overrides applied to outgoing CloudEvents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ce_overrides: Option<CloudEventOverrides>,
}

/// Either a reference to an Addressable object, a literal URI, or both in
/// which case the URI is resolved relative to the object's address.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct Destination {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<KReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Object reference to a sink.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    /// The Kubernetes API Kind name.
    pub kind: String,
    /// Defaults to the namespace of the referencing object when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// API group and version, e.g. `v1` or `serving.knative.dev/v1`.
    pub api_version: String,
}

impl KReference {
    pub fn has_namespace(&self) -> bool {
        self.namespace.as_deref().map_or(false, |ns| !ns.is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct CloudEventOverrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

/// Describes one kind of CloudEvent a source emits.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct CloudEventAttributes {
    #[serde(rename = "type")]
    pub type_: String,
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PingSourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ce_attributes: Option<Vec<CloudEventAttributes>>,
}

/// CloudEvent `source` attribute of events emitted for the named PingSource.
pub fn ping_source_source(namespace: &str, name: &str) -> String {
    format!("/apis/v1/namespaces/{}/pingsources/{}", namespace, name)
}

impl PingSource {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn status_mut(&mut self) -> &mut PingSourceStatus {
        self.status.get_or_insert_with(PingSourceStatus::default)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(|v| v.as_str())
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.condition(tpe))
    }
}

impl PingSourceStatus {
    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.type_ == tpe))
    }

    /// Replace the condition of the same type, keeping the existing entry
    /// (and its transition time) if nothing observable changed.
    pub fn update_condition(&mut self, mut c: Condition) {
        let time = Utc::now();
        c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        if let Some(existing) = conditions.iter().find(|e| e.type_ == c.type_) {
            if existing.status != c.status
                || existing.reason != c.reason
                || existing.message != c.message
                || existing.observed_generation != c.observed_generation
            {
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
        } else {
            conditions.push(c);
        };
        self.conditions = Some(conditions);
        self.update_ready();
    }

    pub fn mark_sink(&mut self, uri: &str) {
        self.sink_uri = Some(uri.to_string());
        self.update_condition(Condition::new(
            CONDITION_SINK_PROVIDED,
            Some(true),
            "SinkProvided",
            String::new(),
        ));
    }

    pub fn mark_no_sink(&mut self, reason: &str, message: String) {
        self.sink_uri = None;
        self.update_condition(Condition::new(
            CONDITION_SINK_PROVIDED,
            Some(false),
            reason,
            message,
        ));
    }

    /// Schedules are validated on admission, so reaching reconcile means valid.
    pub fn mark_schedule(&mut self) {
        self.update_condition(Condition::new(
            CONDITION_VALID_SCHEDULE,
            Some(true),
            "ValidSchedule",
            String::new(),
        ));
    }

    pub fn mark_deployed(&mut self) {
        self.update_condition(Condition::new(
            CONDITION_DEPLOYED,
            Some(true),
            "DeploymentAvailable",
            String::new(),
        ));
    }

    pub fn mark_not_deployed(&mut self, reason: &str, message: String) {
        self.update_condition(Condition::new(
            CONDITION_DEPLOYED,
            Some(false),
            reason,
            message,
        ));
    }

    pub fn set_ce_attributes(&mut self, attributes: Vec<CloudEventAttributes>) {
        self.ce_attributes = Some(attributes);
    }

    /// Ready is True iff all dependent conditions are True, False as soon as
    /// one of them is False and Unknown otherwise.
    fn update_ready(&mut self) {
        let dependents = [
            CONDITION_SINK_PROVIDED,
            CONDITION_VALID_SCHEDULE,
            CONDITION_DEPLOYED,
        ];
        let mut ready = Condition::new(CONDITION_READY, Some(true), "Ready", String::new());
        for tpe in dependents {
            match self.condition(tpe) {
                Some(c) if c.is_true() => continue,
                Some(c) if c.is_false() => {
                    ready = Condition::new(CONDITION_READY, Some(false), &c.reason, c.message.clone());
                    break;
                }
                _ => {
                    ready = Condition::new(
                        CONDITION_READY,
                        None,
                        "Unknown",
                        format!("condition {} is unknown", tpe),
                    );
                }
            }
        }
        let conditions = self.conditions.get_or_insert_with(Vec::new);
        if let Some(existing) = conditions.iter().find(|e| e.type_ == CONDITION_READY) {
            if existing.status == ready.status
                && existing.reason == ready.reason
                && existing.message == ready.message
            {
                return;
            }
        }
        ready.last_transition_time = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        conditions.retain(|c| c.type_ != CONDITION_READY);
        conditions.push(ready);
    }
}
