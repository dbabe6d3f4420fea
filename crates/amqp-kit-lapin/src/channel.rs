use crate::error::map_error;

use amqp_kit::{
    Acker, Channel, Delivery, DeliveryStream, ExchangeKind, Headers, Publishing, QueueInfo,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, future};
use lapin::BasicProperties;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reply code sent when closing normally.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// A lapin channel.
pub(crate) struct LapinChannel {
    pub(crate) inner: lapin::Channel,
}

#[async_trait]
impl Channel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };

        self.inner
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(|e| map_error(&e))
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueInfo, TransportError> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .inner
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| map_error(&e))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            messages: queue.message_count(),
            consumers: queue.consumer_count(),
        })
    }

    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), TransportError> {
        if prefetch_size != 0 {
            debug!(prefetch_size, "prefetch size is not supported, ignoring");
        }

        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|e| map_error(&e))
    }

    async fn bind(&self, queue: &str, key: &str, exchange: &str) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&e))?;

        debug!(queue, consumer_tag = consumer.tag().as_str(), "consumer started");

        let queue = queue.to_string();
        let stream = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    warn!(queue = %queue, "delivery feed failed: {}", e);
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok().map(into_delivery)));

        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        key: &str,
        mandatory: bool,
        immediate: bool,
        msg: &Publishing,
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory,
            immediate,
        };

        self.inner
            .basic_publish(exchange, key, options, &msg.body, properties(msg))
            .await
            .map_err(|e| map_error(&e))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| map_error(&e))
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map(drop)
            .map_err(|e| map_error(&e))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map(drop)
            .map_err(|e| map_error(&e))
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(drop)
            .map_err(|e| map_error(&e))
    }
}

fn into_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let text = |value: &Option<ShortString>| {
        value
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default()
    };

    let mut out = Delivery::new(Arc::new(LapinAcker(delivery.acker.clone())));
    out.exchange = delivery.exchange.as_str().to_string();
    out.routing_key = delivery.routing_key.as_str().to_string();
    out.correlation_id = text(props.correlation_id());
    out.reply_to = text(props.reply_to());
    out.content_type = text(props.content_type());
    out.headers = props.headers().as_ref().map(table_to_headers).unwrap_or_default();
    out.delivery_tag = delivery.delivery_tag;
    out.redelivered = delivery.redelivered;
    out.body = Bytes::from(std::mem::take(&mut delivery.data));
    out
}

fn properties(msg: &Publishing) -> BasicProperties {
    let mut props = BasicProperties::default().with_delivery_mode(msg.delivery_mode.as_u8());

    if !msg.content_type.is_empty() {
        props = props.with_content_type(ShortString::from(msg.content_type.clone()));
    }
    if !msg.correlation_id.is_empty() {
        props = props.with_correlation_id(ShortString::from(msg.correlation_id.clone()));
    }
    if !msg.reply_to.is_empty() {
        props = props.with_reply_to(ShortString::from(msg.reply_to.clone()));
    }
    if !msg.headers.is_empty() {
        props = props.with_headers(headers_to_table(&msg.headers));
    }

    props
}

/// Headers travel as long strings.
pub(crate) fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

/// Non-string header values are dropped.
pub(crate) fn table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}
