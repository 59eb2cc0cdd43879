use crate::{ObjectMeta, ENDPOINTS_ANNOTATION, STATUS_ANNOTATION, STATUS_INJECTED};
use tracing::{debug, info};

/// Namespaces that are never mutated, whatever their pods declare.
const EXEMPT_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Returns true when a pod with the given metadata needs the sidecar.
///
/// A pod is mutated only if it declares NSM endpoints and has not already been
/// marked as injected. Pods in the system namespaces are always skipped.
pub fn is_required(metadata: &ObjectMeta) -> bool {
    if let Some(ns) = metadata.namespace.as_deref() {
        if EXEMPT_NAMESPACES.contains(&ns) {
            info!(%ns, "Skip mutation, it's in special namespace");
            return false;
        }
    }

    let annotations = metadata.annotations.as_ref();
    debug!(?annotations, "Pod's annotations");

    let get = |key: &str| {
        annotations
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .unwrap_or_default()
    };

    let endpoints = get(ENDPOINTS_ANNOTATION);
    let status = get(STATUS_ANNOTATION);
    !endpoints.is_empty() && status.to_lowercase() != STATUS_INJECTED
}
