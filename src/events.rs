//! Remote mutations pushed by the backend over the event stream.
//!
//! The stream delivers named events with a JSON argument; `RemoteEvent`
//! turns the ones the sync core cares about into a single tagged type so
//! that there is exactly one merge function consuming them.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::models::{Category, Notification, Order, Product};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    OrderCreated(Order),
    OrderUpdated(Order),
    OrderDeleted { order_id: String },
    ProductCreated(Product),
    ProductUpdated(Product),
    ProductDeleted { product_id: String },
    CategoryCreated(Category),
    CategoryUpdated(Category),
    CategoryDeleted { category_id: String },
    Notification(Notification),
    /// Payload is informational only; the core re-fetches aggregates.
    DailyClosureCreated(Value),
}

#[derive(Deserialize)]
struct OrderDeleted {
    order_id: String,
}

#[derive(Deserialize)]
struct ProductDeleted {
    product_id: String,
}

#[derive(Deserialize)]
struct CategoryDeleted {
    category_id: String,
}

fn parse<T: serde::de::DeserializeOwned>(name: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SyncError::Decode(format!("{name}: {e}")))
}

impl RemoteEvent {
    /// Decode a named stream event. Names the core does not consume
    /// (`connection_established`, `sync_data`, ...) yield `Ok(None)`.
    pub fn decode(name: &str, data: Value) -> Result<Option<RemoteEvent>> {
        let event = match name {
            "order_created" => RemoteEvent::OrderCreated(parse(name, data)?),
            "order_updated" => RemoteEvent::OrderUpdated(parse(name, data)?),
            "order_deleted" => {
                let d: OrderDeleted = parse(name, data)?;
                RemoteEvent::OrderDeleted {
                    order_id: d.order_id,
                }
            }
            "product_created" => RemoteEvent::ProductCreated(parse(name, data)?),
            "product_updated" => RemoteEvent::ProductUpdated(parse(name, data)?),
            "product_deleted" => {
                let d: ProductDeleted = parse(name, data)?;
                RemoteEvent::ProductDeleted {
                    product_id: d.product_id,
                }
            }
            "category_created" => RemoteEvent::CategoryCreated(parse(name, data)?),
            "category_updated" => RemoteEvent::CategoryUpdated(parse(name, data)?),
            "category_deleted" => {
                let d: CategoryDeleted = parse(name, data)?;
                RemoteEvent::CategoryDeleted {
                    category_id: d.category_id,
                }
            }
            "notification" => RemoteEvent::Notification(parse(name, data)?),
            "daily_closure_created" => RemoteEvent::DailyClosureCreated(data),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::OrderCreated(_) => "order_created",
            RemoteEvent::OrderUpdated(_) => "order_updated",
            RemoteEvent::OrderDeleted { .. } => "order_deleted",
            RemoteEvent::ProductCreated(_) => "product_created",
            RemoteEvent::ProductUpdated(_) => "product_updated",
            RemoteEvent::ProductDeleted { .. } => "product_deleted",
            RemoteEvent::CategoryCreated(_) => "category_created",
            RemoteEvent::CategoryUpdated(_) => "category_updated",
            RemoteEvent::CategoryDeleted { .. } => "category_deleted",
            RemoteEvent::Notification(_) => "notification",
            RemoteEvent::DailyClosureCreated(_) => "daily_closure_created",
        }
    }
}
