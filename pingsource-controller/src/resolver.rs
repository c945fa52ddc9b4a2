//! Turns a sink [`Destination`] into the URL events are delivered to.

use std::future::Future;

use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, Client, ResourceExt,
    api::{DynamicObject, GroupVersionKind},
    discovery,
};
use pingsource_controller_apis::{Destination, KReference, PingSource};
use url::Url;

use crate::errors::ControllerError;

pub(crate) trait SinkResolver {
    /// `destination` is already namespace defaulted, `parent` is the object
    /// the destination belongs to.
    fn uri_from_destination(
        &self,
        destination: &Destination,
        parent: &PingSource,
    ) -> impl Future<Output = Result<Url, ControllerError>> + Send;
}

/// An unscoped reference is local to the source.
pub(crate) fn normalize_destination(namespace: &str, destination: &Destination) -> Destination {
    let mut destination = destination.clone();
    if let Some(reference) = destination.reference.as_mut() {
        if !reference.has_namespace() {
            reference.namespace = Some(namespace.to_string());
        }
    }
    destination
}

/// Resolve the sink of `source`. Any failure is reported as
/// [`ControllerError::SinkNotFound`] carrying the normalized destination.
pub(crate) async fn resolve_sink<R: SinkResolver>(
    resolver: &R,
    source: &PingSource,
) -> Result<Url, ControllerError> {
    let namespace = source.namespace().unwrap_or_default();
    let destination = normalize_destination(&namespace, &source.spec.sink);
    match resolver.uri_from_destination(&destination, source).await {
        Ok(url) => Ok(url),
        Err(e) => Err(ControllerError::SinkNotFound {
            sink: serde_json::to_string(&destination)?,
            reason: e.to_string(),
        }),
    }
}

/// Splits `apiVersion` into group and version, the core group is empty.
fn group_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn service_url(
    reference: &KReference,
    namespace: &str,
    cluster_domain: &str,
) -> Result<Url, ControllerError> {
    let url = format!("http://{}.{}.svc.{}/", reference.name, namespace, cluster_domain);
    Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid service address {}: {}", url, e).into())
}

/// Address of an Addressable, `status.address.url` or else `status.address.hostname`.
fn addressable_url(object: &DynamicObject) -> Result<Url, ControllerError> {
    let address = &object.data["status"]["address"];
    if let Some(url) = address["url"].as_str().filter(|v| !v.is_empty()) {
        return Url::parse(url).map_err(|e| anyhow::anyhow!("invalid address {}: {}", url, e).into());
    }
    if let Some(host) = address["hostname"].as_str().filter(|v| !v.is_empty()) {
        let url = format!("http://{}/", host);
        return Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid address {}: {}", url, e).into());
    }
    Err(anyhow::anyhow!(
        "{} \"{}\" does not contain an address",
        object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("object"),
        object.name_any()
    )
    .into())
}

/// A literal `uri` next to a `ref` is relative to the ref's address.
fn join(base: Url, uri: Option<&str>) -> Result<Url, ControllerError> {
    match uri.filter(|v| !v.is_empty()) {
        Some(uri) => base
            .join(uri)
            .map_err(|e| anyhow::anyhow!("invalid uri {} relative to {}: {}", uri, base, e).into()),
        None => Ok(base),
    }
}

fn absolute(uri: &str) -> Result<Url, ControllerError> {
    let url = Url::parse(uri).map_err(|e| anyhow::anyhow!("invalid uri {}: {}", uri, e))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(anyhow::anyhow!("uri {} is not an absolute URL", uri).into());
    }
    Ok(url)
}

/// [`SinkResolver`] reading addresses from the API server.
#[derive(Clone)]
pub(crate) struct UriResolver {
    client: Client,
    cluster_domain: String,
}

impl UriResolver {
    pub fn new(client: Client, cluster_domain: &str) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.to_string(),
        }
    }

    async fn address_of(&self, reference: &KReference) -> Result<Url, ControllerError> {
        let namespace = reference.namespace.as_deref().unwrap_or_default();
        let (group, version) = group_version(&reference.api_version);
        if group.is_empty() && version == "v1" && reference.kind == "Service" {
            let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            api.get(&reference.name).await?;
            return service_url(reference, namespace, &self.cluster_domain);
        }
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let (resource, _) = discovery::pinned_kind(&self.client, &gvk).await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let object = api.get(&reference.name).await?;
        addressable_url(&object)
    }
}

impl SinkResolver for UriResolver {
    async fn uri_from_destination(
        &self,
        destination: &Destination,
        _parent: &PingSource,
    ) -> Result<Url, ControllerError> {
        match (&destination.reference, destination.uri.as_deref()) {
            (Some(reference), uri) => join(self.address_of(reference).await?, uri),
            (None, Some(uri)) if !uri.is_empty() => absolute(uri),
            _ => Err(anyhow::anyhow!("destination is missing ref and uri").into()),
        }
    }
}
