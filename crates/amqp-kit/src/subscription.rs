//! Subscription descriptors and routing inside a shared queue.

use crate::matcher;
use crate::subscriber::DeliveryHandler;
use crate::transport::{Channel, Delivery};

use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::warn;

/// A routing key pattern and the handler serving deliveries that match it.
#[derive(Clone)]
pub struct Route {
    key: String,
    handler: Arc<dyn DeliveryHandler>,
}

impl Route {
    /// Create a route.
    pub fn new(key: impl Into<String>, handler: impl DeliveryHandler) -> Self {
        Self {
            key: key.into(),
            handler: Arc::new(handler),
        }
    }

    /// Routing key pattern.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Describes one queue, how it is bound, and who serves it.
///
/// The queue is bound to `exchange` under the key of every route. With a
/// single route every delivery goes to its handler; with several, each
/// delivery goes to the first route whose pattern matches its routing key.
#[derive(Clone, Debug)]
pub struct SubscribeInfo {
    pub(crate) name: String,
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) workers: usize,
    pub(crate) routes: Vec<Route>,
}

impl SubscribeInfo {
    /// Serve `queue`, bound to `exchange`, with `handler`.
    ///
    /// The handler's key defaults to the queue name with `_` replaced by `.`.
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>, handler: impl DeliveryHandler) -> Self {
        let queue = queue.into();
        let key = queue.replace('_', ".");

        Self {
            name: String::new(),
            queue,
            exchange: exchange.into(),
            workers: 1,
            routes: vec![Route::new(key, handler)],
        }
    }

    /// Set the consumer name. Empty lets the broker generate one.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of concurrent workers. Zero means one.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { 1 } else { workers };
        self
    }

    /// Replace the key of the first handler.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        if let Some(first) = self.routes.first_mut() {
            first.key = key.into();
        }
        self
    }

    /// Share the queue with another handler bound under `key`.
    #[must_use]
    pub fn route(mut self, key: impl Into<String>, handler: impl DeliveryHandler) -> Self {
        self.routes.push(Route::new(key, handler));
        self
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Exchange the queue is bound to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing keys the queue is bound under, in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(Route::key)
    }

    pub(crate) fn consumer_tag(&self, worker: usize) -> String {
        if self.name.is_empty() {
            String::new()
        } else {
            format!("{}-{worker}", self.name)
        }
    }

    /// Hand a delivery to the route serving it.
    ///
    /// A delivery matching no route is rejected without requeue.
    pub(crate) async fn dispatch(&self, channel: &dyn Channel, delivery: Delivery) {
        let route = match self.routes.as_slice() {
            [only] => Some(only),
            routes => routes
                .iter()
                .find(|route| matcher::matches(&delivery.routing_key, &route.key)),
        };

        if let Some(route) = route {
            route.handler.serve_delivery(channel, delivery).await;
            return;
        }

        warn!(
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            "no route matches delivery, rejecting"
        );
        if let Err(e) = delivery.reject(false).await {
            warn!(queue = %self.queue, "reject failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl DeliveryHandler for Nop {
        async fn serve_delivery(&self, _channel: &dyn Channel, _delivery: Delivery) {}
    }

    #[test]
    fn test_defaults_from_queue_name() {
        let sub = SubscribeInfo::new("billing_invoice_create", "billing", Nop).workers(0);

        assert_eq!(sub.queue(), "billing_invoice_create");
        assert_eq!(sub.exchange(), "billing");
        assert_eq!(sub.keys().collect::<Vec<_>>(), ["billing.invoice.create"]);
        assert_eq!(sub.workers, 1);
        assert_eq!(sub.consumer_tag(0), "");
    }

    #[test]
    fn test_routes_keep_registration_order() {
        let sub = SubscribeInfo::new("orders", "shop", Nop)
            .key("orders.created")
            .route("orders.*", Nop)
            .route("#", Nop)
            .name("orders-worker");

        assert_eq!(
            sub.keys().collect::<Vec<_>>(),
            ["orders.created", "orders.*", "#"]
        );
        assert_eq!(sub.consumer_tag(3), "orders-worker-3");
    }
}
