use futures::{future, TryFutureExt};
use hyper::{Request, Response};
use tracing::{debug, debug_span, Instrument};

/// Wraps a service so that every request and response is logged.
#[derive(Copy, Clone, Debug, Default)]
pub struct TraceRequestsLayer(());

#[derive(Clone, Debug)]
pub struct TraceRequests<S> {
    inner: S,
}

// === impl TraceRequestsLayer ===

impl TraceRequestsLayer {
    pub fn new() -> Self {
        Self(())
    }
}

impl<S> tower::Layer<S> for TraceRequestsLayer {
    type Service = TraceRequests<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceRequests { inner }
    }
}

// === impl TraceRequests ===

impl<S, B, RspB> tower::Service<Request<B>> for TraceRequests<S>
where
    S: tower::Service<Request<B>, Response = Response<RspB>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    RspB: Send + 'static,
{
    type Response = Response<RspB>;
    type Error = S::Error;
    type Future = future::BoxFuture<'static, Result<Response<RspB>, S::Error>>;

    #[inline]
    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let span = debug_span!("request", method = %req.method(), path = %req.uri().path());
        span.in_scope(|| {
            debug!(
                uri = %req.uri(),
                version = ?req.version(),
                headers = ?req.headers(),
                "Request received"
            )
        });

        Box::pin(
            self.inner
                .call(req)
                .map_ok(|rsp| {
                    debug!(status = %rsp.status(), "Response sent");
                    rsp
                })
                .instrument(span),
        )
    }
}
