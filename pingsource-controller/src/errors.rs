/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_already_exists(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }

    /// Optimistic concurrency failure, i.e. a stale `resourceVersion`.
    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason != "AlreadyExists" => true,
            _ => false,
        }
    }
}

pub(crate) const INTERNAL_ERROR: &'static str = "InternalError";

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The sink could not be turned into an address, carries the serialized
    /// (namespace defaulted) destination.
    #[error("Sink not found: {sink}: {reason}")]
    SinkNotFound { sink: String, reason: String },
    /// An object exists at the expected name, but is controlled by someone else.
    #[error("{kind} \"{namespace}/{name}\" is not owned by PingSource \"{owner}\"")]
    OwnershipConflict {
        kind: String,
        namespace: String,
        name: String,
        owner: String,
    },
    /// The PingSource lacks a metadata field required to derive its managed objects.
    #[error("PingSource is missing {0}")]
    MissingObjectKey(&'static str),
    /// Failure of one orchestration step, `reason` is the event reason to report.
    #[error("{message}: {source}")]
    Stage {
        reason: &'static str,
        message: &'static str,
        #[source]
        source: Box<ControllerError>,
    },
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::OwnershipConflict { .. } => false,
            ControllerError::MissingObjectKey(_) => false,
            ControllerError::Serde(_) => false,
            ControllerError::Stage { source, .. } => source.is_temporary(),
            _ => true,
        }
    }

    /// Event reason reported on the PingSource for this error.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            ControllerError::SinkNotFound { .. } => "SinkNotFound",
            ControllerError::Stage { reason, .. } => *reason,
            _ => INTERNAL_ERROR,
        }
    }

    pub(crate) fn stage(
        reason: &'static str,
        message: &'static str,
    ) -> impl FnOnce(ControllerError) -> ControllerError {
        move |source| ControllerError::Stage {
            reason,
            message,
            source: Box::new(source),
        }
    }
}

/// Result of one reconcile, as reported to the invoking controller runtime.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success,
    /// Transient, the invoker should retry later.
    RetryableFailure(ControllerError),
    /// Retrying without a new trigger would fail the same way.
    TerminalFailure(ControllerError),
}

impl Outcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure(_) => "retryable",
            Outcome::TerminalFailure(_) => "terminal",
        }
    }

    pub(crate) fn into_result(self) -> Result<(), ControllerError> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::RetryableFailure(e) | Outcome::TerminalFailure(e) => Err(e),
        }
    }
}

impl From<Result<(), ControllerError>> for Outcome {
    fn from(result: Result<(), ControllerError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) if e.is_temporary() => Outcome::RetryableFailure(e),
            Err(e) => Outcome::TerminalFailure(e),
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_already_exists_are_distinct() {
        let exists = api_error(409, "AlreadyExists");
        let conflict = api_error(409, "Conflict");
        assert!(exists.is_already_exists());
        assert!(!exists.is_conflict());
        assert!(conflict.is_conflict());
        assert!(!conflict.is_already_exists());
        assert!(api_error(404, "NotFound").is_not_found());
    }

    #[test]
    fn outcome_classification() {
        let conflict = ControllerError::OwnershipConflict {
            kind: "Deployment".to_string(),
            namespace: "default".to_string(),
            name: "x".to_string(),
            owner: "p1".to_string(),
        };
        let staged = ControllerError::stage("PingSourceDeploymentFailed", "creating receive adapter")(conflict);
        assert_eq!(staged.reason(), "PingSourceDeploymentFailed");
        assert!(matches!(Outcome::from(Err(staged)), Outcome::TerminalFailure(_)));

        let transient = ControllerError::from(api_error(409, "Conflict"));
        assert_eq!(transient.reason(), INTERNAL_ERROR);
        assert!(matches!(Outcome::from(Err(transient)), Outcome::RetryableFailure(_)));
        assert!(matches!(Outcome::from(Ok(())), Outcome::Success));
    }
}
