use pingsource_controller_apis::{PingSource, SCOPE_ANNOTATION, SCOPE_RESOURCE};

/// Which adapter deployment serves a PingSource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Served by the single shared adapter.
    Cluster,
    /// Served by a dedicated adapter with its own identity.
    Resource,
}

/// Anything but an explicit `resource` annotation routes to [`Scope::Cluster`].
pub(crate) fn route(source: &PingSource) -> Scope {
    match source.annotation(SCOPE_ANNOTATION).map(str::trim) {
        Some(SCOPE_RESOURCE) => Scope::Resource,
        _ => Scope::Cluster,
    }
}
