#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod patch;
pub mod policy;
pub mod sidecar;

pub use self::{
    patch::{PatchBuilder, PatchEncodeError, ResourceKind},
    policy::is_required,
    sidecar::{ConfigLoadError, SidecarSpec},
};
pub use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Annotation through which a pod declares the network service endpoints it
/// serves. Its presence is what makes a pod a candidate for injection.
pub const ENDPOINTS_ANNOTATION: &str = "ns.networkservicemesh.io/endpoints";

/// Annotation recording that the sidecar has been injected.
pub const STATUS_ANNOTATION: &str = "ns.networkservicemesh.io/status";

pub const STATUS_INJECTED: &str = "injected";
