//! Hot-reloaded logging and metrics configuration handed to the adapters.
//!
//! Both ConfigMaps are watched independently. Every snapshot is validated
//! and serialized into an opaque string, reconciles read one immutable
//! [`AdapterConfig`] at their start.

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;
use serde_json::Value;

use crate::errors::ControllerError;

/// Reserved key holding documentation only.
const EXAMPLE_KEY: &'static str = "_example";

const ZAP_LOGGER_CONFIG: &'static str = "zap-logger-config";
const LOGLEVEL_PREFIX: &'static str = "loglevel.";
const LOG_LEVELS: [&'static str; 7] = ["debug", "info", "warn", "error", "dpanic", "panic", "fatal"];

const BACKEND_DESTINATION: &'static str = "metrics.backend-destination";
const REPORTING_PERIOD: &'static str = "metrics.reporting-period-seconds";
const BACKENDS: [&'static str; 4] = ["prometheus", "opencensus", "stackdriver", "none"];

/// Component name reported by the adapters' metrics.
const COMPONENT: &'static str = "pingsource";

const DEFAULT_ZAP_LOGGER_CONFIG: &'static str = r#"{
  "level": "info",
  "development": false,
  "outputPaths": ["stdout"],
  "errorOutputPaths": ["stderr"],
  "encoding": "json",
  "encoderConfig": {
    "timeKey": "ts",
    "levelKey": "level",
    "nameKey": "logger",
    "callerKey": "caller",
    "messageKey": "msg",
    "stacktraceKey": "stacktrace",
    "lineEnding": "",
    "levelEncoder": "",
    "timeEncoder": "iso8601",
    "durationEncoder": "",
    "callerEncoder": ""
  }
}"#;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AdapterConfig {
    /// Value of `K_LOGGING_CONFIG`.
    pub logging_config: String,
    /// Value of `K_METRICS_CONFIG`.
    pub metrics_config: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MetricsOptions<'a> {
    domain: &'a str,
    component: &'a str,
    config_map: &'a BTreeMap<String, String>,
}

fn without_example(cm: &ConfigMap) -> BTreeMap<String, String> {
    let mut data = cm.data.clone().unwrap_or_default();
    data.remove(EXAMPLE_KEY);
    data
}

fn invalid(message: String) -> ControllerError {
    ControllerError::Any(anyhow::anyhow!(message))
}

fn logging_config(mut data: BTreeMap<String, String>) -> Result<String, ControllerError> {
    let zap = data
        .entry(ZAP_LOGGER_CONFIG.to_string())
        .or_insert_with(|| DEFAULT_ZAP_LOGGER_CONFIG.to_string());
    serde_json::from_str::<Value>(zap)?;
    for (key, level) in data.iter() {
        if key.starts_with(LOGLEVEL_PREFIX) && !LOG_LEVELS.contains(&level.trim()) {
            return Err(invalid(format!("invalid log level {:?} for {}", level, key)));
        }
    }
    Ok(serde_json::to_string(&data)?)
}

fn metrics_config(
    domain: &str,
    data: &BTreeMap<String, String>,
) -> Result<String, ControllerError> {
    if let Some(backend) = data.get(BACKEND_DESTINATION) {
        if !BACKENDS.contains(&backend.trim()) {
            return Err(invalid(format!("unsupported metrics backend {:?}", backend)));
        }
    }
    if let Some(period) = data.get(REPORTING_PERIOD) {
        period.trim().parse::<u64>().map_err(|e| {
            invalid(format!("invalid {} {:?}: {}", REPORTING_PERIOD, period, e))
        })?;
    }
    Ok(serde_json::to_string(&MetricsOptions {
        domain,
        component: COMPONENT,
        config_map: data,
    })?)
}

/// Process wide [`AdapterConfig`], updated by the ConfigMap watchers.
pub(crate) struct ConfigStore {
    metrics_domain: String,
    current: ArcSwap<AdapterConfig>,
}

impl ConfigStore {
    pub fn new(metrics_domain: &str) -> Self {
        let empty = BTreeMap::new();
        let initial = AdapterConfig {
            logging_config: logging_config(BTreeMap::new()).unwrap_or_default(),
            metrics_config: metrics_config(metrics_domain, &empty).unwrap_or_default(),
        };
        Self {
            metrics_domain: metrics_domain.to_string(),
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn snapshot(&self) -> Arc<AdapterConfig> {
        self.current.load_full()
    }

    pub fn update_from_logging_config_map(&self, cm: &ConfigMap) {
        match logging_config(without_example(cm)) {
            Ok(logging_config) => {
                self.current.rcu(|c| AdapterConfig {
                    logging_config: logging_config.clone(),
                    metrics_config: c.metrics_config.clone(),
                });
                info!("Updated logging config from ConfigMap {}", name(cm));
            }
            Err(e) => warn!(
                "Ignoring logging ConfigMap {}, keeping previous config: {}",
                name(cm),
                e
            ),
        }
    }

    pub fn update_from_metrics_config_map(&self, cm: &ConfigMap) {
        match metrics_config(&self.metrics_domain, &without_example(cm)) {
            Ok(metrics_config) => {
                self.current.rcu(|c| AdapterConfig {
                    logging_config: c.logging_config.clone(),
                    metrics_config: metrics_config.clone(),
                });
                info!("Updated metrics config from ConfigMap {}", name(cm));
            }
            Err(e) => warn!(
                "Ignoring metrics ConfigMap {}, keeping previous config: {}",
                name(cm),
                e
            ),
        }
    }
}

fn name(cm: &ConfigMap) -> &str {
    cm.metadata.name.as_deref().unwrap_or("")
}
