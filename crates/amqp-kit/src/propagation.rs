//! Trace context propagation through message headers.

use crate::error::BoxError;
use crate::middleware::ReplyContext;
use crate::subscriber::Endpoint;
use crate::transport::{Channel, Delivery, Headers, Publishing};

use async_trait::async_trait;
use opentelemetry::trace::{FutureExt, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, global};

const TRACER_NAME: &str = "amqp-kit";

/// Inject `cx` into message headers with the global propagator.
pub fn inject_context(cx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, headers));
}

/// Extract the remote trace context carried by message headers.
#[must_use]
pub fn extract_context(headers: &Headers) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(headers))
}

/// Start a producer span for a publish under `parent` and inject it into
/// `headers`. The returned context owns the span; it ends when the context
/// is dropped.
pub fn start_publish_span(
    parent: &Context,
    exchange: &str,
    key: &str,
    correlation_id: &str,
    headers: &mut Headers,
) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("publish_key: {key}"))
        .with_kind(SpanKind::Producer)
        .with_attributes(vec![
            KeyValue::new("key", key.to_string()),
            KeyValue::new("exchange", exchange.to_string()),
            KeyValue::new("corID", correlation_id.to_string()),
        ])
        .start_with_context(&tracer, parent);

    let cx = parent.with_span(span);
    inject_context(&cx, headers);
    cx
}

/// Runs an endpoint's invoke step inside a server span that continues the
/// trace carried by the delivery.
///
/// Deliveries without a remote span context are served untraced.
pub struct Traced<E> {
    inner: E,
    operation: String,
}

impl<E: Endpoint> Traced<E> {
    /// Wrap `inner`, naming spans `operation`.
    pub fn new(inner: E, operation: impl Into<String>) -> Self {
        Self {
            inner,
            operation: operation.into(),
        }
    }
}

#[async_trait]
impl<E: Endpoint> Endpoint for Traced<E> {
    type Request = E::Request;
    type Response = E::Response;

    async fn decode(&self, cx: &ReplyContext, delivery: &Delivery) -> Result<Self::Request, BoxError> {
        self.inner.decode(cx, delivery).await
    }

    async fn invoke(&self, cx: &ReplyContext, request: Self::Request) -> Result<Self::Response, BoxError> {
        let remote = cx.trace_context();
        if !remote.span().span_context().is_valid() {
            return self.inner.invoke(cx, request).await;
        }

        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(self.operation.clone())
            .with_kind(SpanKind::Server)
            .start_with_context(&tracer, remote);
        let span_cx = remote.with_span(span);

        let result = self
            .inner
            .invoke(cx, request)
            .with_context(span_cx.clone())
            .await;

        if let Err(err) = &result {
            let span = span_cx.span();
            span.set_attribute(KeyValue::new("error", err.to_string()));
            span.set_status(Status::error(err.to_string()));
        }
        span_cx.span().end();

        result
    }

    async fn encode(
        &self,
        cx: &ReplyContext,
        delivery: &Delivery,
        channel: &dyn Channel,
        publishing: &mut Publishing,
        response: Self::Response,
    ) -> Result<(), BoxError> {
        self.inner
            .encode(cx, delivery, channel, publishing, response)
            .await
    }
}
