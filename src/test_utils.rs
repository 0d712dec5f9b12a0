//! Test fixtures: a small order aggregate and record builders.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::aggregate::{Aggregate, Deletable};
use crate::codec::{decode_json, encode_json, DecodeError, Decoded, DomainEvent, EncodeError};
use crate::record::{EventRecord, RawEventRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    OrderPlaced { customer: String },
    ItemAdded { sku: String, quantity: u32 },
    OrderShipped,
    OrderDeleted,
}

#[derive(Deserialize)]
struct PlacedPayload {
    customer: String,
}

#[derive(Deserialize)]
struct ItemAddedPayload {
    sku: String,
    quantity: u32,
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced { .. } => "OrderPlaced",
            OrderEvent::ItemAdded { .. } => "ItemAdded",
            OrderEvent::OrderShipped => "OrderShipped",
            OrderEvent::OrderDeleted => "OrderDeleted",
        }
    }

    fn encode(&self) -> Result<Bytes, EncodeError> {
        let body = match self {
            OrderEvent::OrderPlaced { customer } => json!({ "customer": customer }),
            OrderEvent::ItemAdded { sku, quantity } => json!({ "sku": sku, "quantity": quantity }),
            OrderEvent::OrderShipped | OrderEvent::OrderDeleted => json!({}),
        };
        encode_json(self.event_type(), &body)
    }

    fn decode(event_type: &str, data: &[u8]) -> Decoded<Self> {
        match event_type {
            "OrderPlaced" => decode_json::<PlacedPayload>(event_type, data)
                .map(|p| OrderEvent::OrderPlaced {
                    customer: p.customer,
                }),
            "ItemAdded" => decode_json::<ItemAddedPayload>(event_type, data).map(|p| {
                OrderEvent::ItemAdded {
                    sku: p.sku,
                    quantity: p.quantity,
                }
            }),
            "OrderShipped" => {
                decode_json::<serde_json::Value>(event_type, data).map(|_| OrderEvent::OrderShipped)
            }
            "OrderDeleted" => {
                decode_json::<serde_json::Value>(event_type, data).map(|_| OrderEvent::OrderDeleted)
            }
            "LegacyNote" => Decoded::Skip,
            other => Decoded::Error(DecodeError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderStatus {
    #[default]
    Draft,
    Placed,
    Shipped,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    pub customer: Option<String>,
    pub items: BTreeMap<String, u32>,
    pub status: OrderStatus,
}

impl Order {
    pub fn ship(&self) -> Result<Vec<OrderEvent>, String> {
        if self.status != OrderStatus::Placed {
            return Err(format!("cannot ship order in status {:?}", self.status));
        }
        Ok(vec![OrderEvent::OrderShipped])
    }
}

impl Aggregate for Order {
    const KIND: &'static str = "order";

    type Event = OrderEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced { customer } => {
                self.customer = Some(customer.clone());
                self.status = OrderStatus::Placed;
            }
            OrderEvent::ItemAdded { sku, quantity } => {
                *self.items.entry(sku.clone()).or_default() += quantity;
            }
            OrderEvent::OrderShipped => self.status = OrderStatus::Shipped,
            OrderEvent::OrderDeleted => self.status = OrderStatus::Deleted,
        }
    }
}

impl Deletable for Order {
    fn mark_as_deleted(&self) -> Self::Event {
        OrderEvent::OrderDeleted
    }
}

/// Aggregate without a deletion capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub entries: u32,
}

impl Aggregate for Ledger {
    const KIND: &'static str = "ledger";

    type Event = OrderEvent;

    fn apply(&mut self, _event: &Self::Event) {
        self.entries += 1;
    }
}

pub fn raw_record(stream: &str, event_type: &str, data: &[u8]) -> RawEventRecord {
    EventRecord {
        stream_name: stream.to_string(),
        event_type: event_type.to_string(),
        id: Uuid::new_v4(),
        stream_position: 0,
        commit_position: 0,
        recorded_at: Utc::now(),
        data: Bytes::copy_from_slice(data),
        metadata: Bytes::new(),
    }
}

pub fn decoded_record(stream: &str, position: u64, event: OrderEvent) -> EventRecord<OrderEvent> {
    EventRecord {
        stream_name: stream.to_string(),
        event_type: event.event_type().to_string(),
        id: Uuid::new_v4(),
        stream_position: position,
        commit_position: position,
        recorded_at: Utc::now(),
        data: event,
        metadata: Bytes::new(),
    }
}
