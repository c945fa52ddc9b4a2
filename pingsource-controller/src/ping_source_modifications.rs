use crate::{cluster::StatusClient, errors::ControllerError};
use json_patch::diff;
use pingsource_controller_apis::PingSource;
use std::ops::DerefMut;

/// Helper construct to track status changes of a [`PingSource`] during one
/// reconcile and write them back only if something changed.
pub(crate) struct PingSourceModifications {
    original: PingSource,
    pub modified: PingSource,
}

impl std::ops::Deref for PingSourceModifications {
    type Target = PingSource;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for PingSourceModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl PingSourceModifications {
    pub(crate) fn new(original: PingSource) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn get_status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&self.original.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Write the status if it changed. The write carries the observed
    /// `resourceVersion`, a concurrent change makes it fail with a conflict.
    pub(crate) async fn update_status<C: StatusClient<PingSource>>(
        &mut self,
        client: &C,
    ) -> Result<bool, ControllerError> {
        if let Some(patch) = self.get_status_patch()? {
            debug!(
                "Patch status of PingSource {} ({:?}) with {}",
                self.original.id(),
                self.original.metadata.resource_version,
                serde_json::to_string(&patch)?
            );
            self.modified = client.replace_status(&self.modified).await?;
            self.original = self.modified.clone();
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
