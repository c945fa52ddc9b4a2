//! Get-or-create-or-update of one managed object.

use kube::{Resource, ResourceExt};
use pingsource_controller_apis::PingSource;

use crate::{
    cluster::{Lister, ManagedKind, ObjectClient},
    drift::has_drifted,
    errors::{ControllerError, ExtKubeApiError},
    events::{Notifier, Severity},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Created,
    Updated,
    Unchanged,
}

/// Controller owner uid, if any.
fn controller_uid<K: Resource>(object: &K) -> Option<&str> {
    object
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| o.uid.as_str())
}

/// Objects desired with an owner must be controlled by that same owner.
fn verify_owner<K: ManagedKind>(
    source: &PingSource,
    desired: &K,
    live: &K,
) -> Result<(), ControllerError> {
    let Some(expected) = controller_uid(desired) else {
        return Ok(());
    };
    if controller_uid(live) == Some(expected) {
        Ok(())
    } else {
        Err(ControllerError::OwnershipConflict {
            kind: K::kind(&()).to_string(),
            namespace: live.namespace().unwrap_or_default(),
            name: live.name_any(),
            owner: source.name_any(),
        })
    }
}

fn subject<K: ManagedKind>(desired: &K) -> String {
    let kind = K::kind(&());
    if controller_uid(desired).is_some() {
        format!("{} {:?}", kind, desired.name_any())
    } else {
        format!("Cluster-scoped {} {:?}", kind, desired.name_any())
    }
}

/// Make the live object at the name and namespace of `desired` match it.
///
/// Only fields reported by [`ManagedKind::owned_fields`] are compared and
/// overwritten. A create racing with another writer is resolved by reading
/// back the winner. `deprecated_name` names an object of the same kind left
/// behind by an older naming scheme, removed before the first create.
pub(crate) async fn ensure<K, C, N>(
    cluster: &C,
    notifier: &N,
    source: &PingSource,
    desired: K,
    deprecated_name: Option<&str>,
) -> Result<(K, Change), ControllerError>
where
    K: ManagedKind,
    C: Lister<K> + ObjectClient<K>,
    N: Notifier,
{
    let kind = K::kind(&()).to_string();
    let namespace = desired
        .namespace()
        .ok_or(ControllerError::MissingObjectKey(".metadata.namespace"))?;
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;

    let live = match cluster.lookup(&namespace, &name) {
        Some(live) => K::clone(&live),
        None => {
            if let Some(old) = deprecated_name.filter(|old| *old != name) {
                remove_deprecated::<K, _, _>(cluster, notifier, source, &namespace, old).await?;
            }
            match cluster.create(&desired).await {
                Ok(created) => {
                    info!("Created {} {}/{} for {}", kind, namespace, name, source.id());
                    notifier
                        .emit(
                            source,
                            Severity::Normal,
                            &format!("PingSource{}Created", kind),
                            format!("{} created", subject(&desired)),
                        )
                        .await;
                    return Ok((created, Change::Created));
                }
                Err(e) if e.is_already_exists() => {
                    debug!("{} {}/{} already exists, reading it back", kind, namespace, name);
                    cluster.get(&namespace, &name).await?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    verify_owner(source, &desired, &live)?;

    let wanted = desired.owned_fields()?;
    if !has_drifted(&wanted, &live.owned_fields()?) {
        debug!("{} {}/{} is up to date", kind, namespace, name);
        return Ok((live, Change::Unchanged));
    }

    let mut updated = live;
    updated.adopt_owned_fields(&desired);
    let updated = match cluster.replace(&updated).await {
        Ok(updated) => updated,
        Err(e) if e.is_conflict() => {
            debug!("{} {}/{} changed concurrently, retrying later", kind, namespace, name);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    info!("Updated {} {}/{} for {}", kind, namespace, name, source.id());
    notifier
        .emit(
            source,
            Severity::Normal,
            &format!("PingSource{}Updated", kind),
            format!("{} updated", subject(&desired)),
        )
        .await;
    Ok((updated, Change::Updated))
}

/// Delete the object left behind under `old_name`, tolerating its absence.
async fn remove_deprecated<K, C, N>(
    cluster: &C,
    notifier: &N,
    source: &PingSource,
    namespace: &str,
    old_name: &str,
) -> Result<(), ControllerError>
where
    K: ManagedKind,
    C: ObjectClient<K>,
    N: Notifier,
{
    let kind = K::kind(&()).to_string();
    match ObjectClient::<K>::delete(cluster, namespace, old_name).await {
        Ok(()) => {
            info!("Deleted deprecated {} {}/{}", kind, namespace, old_name);
            notifier
                .emit(
                    source,
                    Severity::Normal,
                    &format!("PingSource{}Deleted", kind),
                    format!("Deprecated {} {:?} deleted", kind, old_name),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
