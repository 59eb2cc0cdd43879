use crate::{
    core::{is_required, PatchBuilder, Pod, SidecarSpec},
    metrics::{AdmissionMetrics, Outcome},
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{body::Body as HttpBody, http, Request, Response};
use kube::core::DynamicObject;
use serde_json::Value;
use std::{convert::Infallible, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The only route served by the webhook.
pub const MUTATE_PATH: &str = "/mutate";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Serves `POST /mutate`, injecting the sidecar into pods that request it.
#[derive(Clone, Debug)]
pub struct Mutate {
    patches: PatchBuilder,
    metrics: AdmissionMetrics,
}

/// Errors that prevent an admission verdict from being produced.
///
/// Transport-level failures become HTTP error statuses; everything else is
/// reported to the API server as a denied admission response.
#[derive(Debug, Error)]
pub enum Error {
    #[error("empty body")]
    EmptyBody,

    #[error("invalid Content-Type, expect `application/json`")]
    UnexpectedContentType,

    #[error("can't decode body: {0}")]
    DecodeBody(#[source] serde_json::Error),

    #[error("invalid admission review: {0}")]
    InvalidReview(#[source] BoxError),

    #[error("admission request missing 'object'")]
    MissingObject,

    #[error("could not unmarshal raw object: {0}")]
    DecodePod(#[source] serde_json::Error),

    #[error("could not encode the patch operations of pod: {0}")]
    EncodePatch(#[source] BoxError),

    #[error("can't encode response: {0}")]
    EncodeResponse(#[source] serde_json::Error),
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Body = http_body_util::Full<bytes::Bytes>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

// === impl Mutate ===

impl<B> tower::Service<Request<B>> for Mutate
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display + Send,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let mutate = self.clone();
        Box::pin(async move { Ok(mutate.handle(req).await) })
    }
}

impl Mutate {
    pub fn new(sidecar: Arc<SidecarSpec>, metrics: AdmissionMetrics) -> Self {
        Self {
            patches: PatchBuilder::new(sidecar),
            metrics,
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: HttpBody,
        B::Error: std::fmt::Display,
    {
        let review = match self.review(req).await {
            Ok(review) => review,
            Err(error) if error.status().is_none() => {
                self.metrics.observe(Outcome::Denied);
                AdmissionResponse::invalid(error).into_review()
            }
            Err(error) => {
                self.metrics.observe(Outcome::Rejected);
                return reject(error);
            }
        };

        json_response(&review).unwrap_or_else(reject)
    }

    /// Decodes the admission review carried by `req` and answers it.
    async fn review<B>(&self, req: Request<B>) -> Result<AdmissionReview, Error>
    where
        B: HttpBody,
        B::Error: std::fmt::Display,
    {
        let content_type = req.headers().get(http::header::CONTENT_TYPE).cloned();

        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                warn!(%error, "Failed to read request body");
                bytes::Bytes::new()
            }
        };
        if body.is_empty() {
            return Err(Error::EmptyBody);
        }

        if content_type.as_ref().map(|v| v.as_bytes()) != Some(JSON_CONTENT_TYPE.as_bytes()) {
            warn!(?content_type, "Content-Type, expect {JSON_CONTENT_TYPE}");
            return Err(Error::UnexpectedContentType);
        }

        let mut review = serde_json::from_slice::<Value>(&body).map_err(|error| {
            warn!(%error, "Can't decode body");
            Error::DecodeBody(error)
        })?;
        let object = take_object(&mut review);
        let review = serde_json::from_value::<AdmissionReview>(review).map_err(|error| {
            warn!(%error, "Can't decode admission review");
            Error::DecodeBody(error)
        })?;
        let req: AdmissionRequest = review.try_into().map_err(
            |error: kube::core::admission::ConvertAdmissionReviewError| {
                warn!(%error, "Invalid admission request");
                Error::InvalidReview(error.into())
            },
        )?;

        Ok(self.admit(req, object).into_review())
    }

    /// Answers `req` for the pod in `object`.
    fn admit(&self, req: AdmissionRequest, object: Option<Value>) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let pod = match parse_pod(object) {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, uid = %req.uid, "Failed to parse pod");
                self.metrics.observe(Outcome::Denied);
                return rsp.deny(error);
            }
        };

        info!(
            uid = %req.uid,
            kind = %req.kind.kind,
            namespace = ?req.namespace,
            name = %req.name,
            pod = ?pod.metadata.name,
            operation = ?req.operation,
            user = ?req.user_info.username,
            "Admission review received"
        );

        if !is_required(&pod.metadata) {
            info!(uid = %req.uid, "Skipping mutation due to policy check");
            self.metrics.observe(Outcome::Skipped);
            return rsp;
        }

        match self.mutate(rsp, &pod) {
            Ok(rsp) => {
                info!(uid = %req.uid, "Admission response added to the admission review");
                self.metrics.observe(Outcome::Injected);
                rsp
            }
            Err(error) => {
                warn!(%error, uid = %req.uid, "Failed to patch pod");
                self.metrics.observe(Outcome::Denied);
                AdmissionResponse::from(&req).deny(error)
            }
        }
    }

    fn mutate(&self, rsp: AdmissionResponse, pod: &Pod) -> Result<AdmissionResponse, Error> {
        let patch = self
            .patches
            .create_patch(pod)
            .map_err(|e| Error::EncodePatch(e.into()))?;
        debug!(?patch);
        rsp.with_patch(patch).map_err(|e| Error::EncodePatch(e.into()))
    }
}

// === impl Error ===

impl Error {
    /// The HTTP status for errors that are not reported as an admission
    /// verdict.
    fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::EmptyBody => Some(http::StatusCode::BAD_REQUEST),
            Self::UnexpectedContentType => Some(http::StatusCode::UNSUPPORTED_MEDIA_TYPE),
            Self::EncodeResponse(_) => Some(http::StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }
}

/// Detaches `request.object` from a raw review so that a malformed pod is
/// reported against its request rather than as an undecodable envelope.
fn take_object(review: &mut Value) -> Option<Value> {
    review
        .get_mut("request")
        .and_then(|req| req.get_mut("object"))
        .map(Value::take)
}

fn parse_pod(object: Option<Value>) -> Result<Pod, Error> {
    match object {
        None | Some(Value::Null) => Err(Error::MissingObject),
        Some(obj) => serde_json::from_value(obj).map_err(Error::DecodePod),
    }
}

fn json_response(review: &AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(review).map_err(Error::EncodeResponse)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn reject(error: Error) -> Response<Body> {
    warn!(%error, "Rejecting admission request");
    let status = error
        .status()
        .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, error.to_string())
}

fn text_response(status: http::StatusCode, msg: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(msg))
        .expect("error response must be valid")
}
