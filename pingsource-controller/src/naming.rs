use pingsource_controller_apis::PingSource;
use sha2::{Digest, Sha256};

use crate::errors::ControllerError;

/// Maximum length of a DNS-1123 label, which bounds most object names.
const LONGEST: usize = 63;
/// Number of hex digits of the name hash spliced into truncated names.
const HASH_LEN: usize = 32;

fn short_hash(input: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest.truncate(HASH_LEN);
    digest
}

fn truncate(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Deterministic name of an object derived from `parent`, always at most 63
/// characters. Long parents are shortened and disambiguated by a hash.
pub(crate) fn child_name(parent: &str, suffix: &str) -> String {
    if parent.len() + suffix.len() <= LONGEST {
        return format!("{}{}", parent, suffix);
    }
    if suffix.len() + HASH_LEN < LONGEST {
        let head = LONGEST - HASH_LEN - suffix.len();
        format!("{}{}{}", truncate(parent, head), short_hash(parent), suffix)
    } else {
        let combined = format!("{}{}", parent, suffix);
        format!(
            "{}{}",
            truncate(&combined, LONGEST - HASH_LEN),
            short_hash(&combined)
        )
    }
}

fn identity(source: &PingSource) -> Result<(&str, &str), ControllerError> {
    let name = source
        .metadata
        .name
        .as_deref()
        .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
    let uid = source
        .metadata
        .uid
        .as_deref()
        .ok_or(ControllerError::MissingObjectKey(".metadata.uid"))?;
    Ok((name, uid))
}

/// Name shared by the service account, role binding and deployment of a
/// resource scoped PingSource.
pub(crate) fn receive_adapter_name(source: &PingSource) -> Result<String, ControllerError> {
    let (name, uid) = identity(source)?;
    Ok(child_name(&format!("pingsource-{}", name), uid))
}

/// The deployment name used by releases before [`receive_adapter_name`].
/// Only consulted to remove such deployments, see `MIGRATE_DEPRECATED_NAMES`.
pub(crate) fn deprecated_receive_adapter_name(
    source: &PingSource,
) -> Result<String, ControllerError> {
    let (name, uid) = identity(source)?;
    let prefix = format!("pingsource-{}", name);
    let room = LONGEST.saturating_sub(uid.len() + 1);
    let generated = format!("{}-{}", truncate(&prefix, room), uid);
    Ok(generated.trim_matches('-').to_string())
}
