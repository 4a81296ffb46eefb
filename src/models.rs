//! Domain model shared by the REST client, the event stream and the cache.
//!
//! Field names follow the backend's JSON documents (`_id`, `products`,
//! `special_note`, Spanish enum values) so every type round-trips through
//! the API, the socket events and the offline snapshots unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// Tolerance used when comparing currency amounts.
pub const CURRENCY_EPSILON: f64 = 0.005;

/// Round to whole cents.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// The backend emits naive ISO-8601 timestamps (`2024-05-01T12:00:00.123456`)
/// that are UTC by convention. Accept both those and RFC 3339.
pub(crate) mod utc_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let trimmed = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_str(&dt.to_rfc3339()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            match raw {
                Some(raw) => super::parse(&raw).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid timestamp: {raw}"))
                }),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Staff role a client session runs as. Scopes the event-stream
/// subscription and decides which notifications are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "barra")]
    Bar,
    #[serde(rename = "camarero_1")]
    Waiter1,
    #[serde(rename = "camarero_2")]
    Waiter2,
    #[serde(rename = "administrador")]
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Bar, Role::Waiter1, Role::Waiter2, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bar => "barra",
            Role::Waiter1 => "camarero_1",
            Role::Waiter2 => "camarero_2",
            Role::Admin => "administrador",
        }
    }

    /// Login name shown for the role.
    pub fn username(&self) -> &'static str {
        match self {
            Role::Bar => "usuario1",
            Role::Waiter1 => "usuario2",
            Role::Waiter2 => "usuario3",
            Role::Admin => "administrador",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == trimmed)
            .ok_or_else(|| format!("unknown role: {trimmed}"))
    }
}

/// Physical seating area of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Zone {
    #[serde(rename = "terraza_exterior")]
    ExteriorTerrace,
    #[serde(rename = "salon_interior")]
    InteriorLounge,
    #[serde(rename = "terraza_interior")]
    InteriorTerrace,
    #[serde(rename = "barra")]
    Bar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "en_preparacion")]
    InPreparation,
    #[serde(rename = "listo")]
    Ready,
    #[serde(rename = "entregado")]
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "efectivo")]
    Cash,
    #[serde(rename = "tarjeta")]
    Card,
    #[serde(rename = "ambos")]
    Mixed,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

fn default_quantity() -> u32 {
    1
}

/// One product line of an order, with the product data snapshotted at
/// order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub name: String,
    pub category: String,
    pub price: f64,
    /// Catalog price before any manual override. Older documents omit it.
    #[serde(default)]
    pub original_price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub is_paid: bool,
}

impl OrderLine {
    pub fn from_product(product: &Product, quantity: u32) -> Self {
        Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            category: product.category.clone(),
            price: product.price,
            original_price: product.price,
            quantity: quantity.max(1),
            note: None,
            is_paid: false,
        }
    }

    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }

    pub fn is_overridden(&self) -> bool {
        (self.price - self.original_price).abs() > CURRENCY_EPSILON
    }
}

/// Append-only record of money received against part of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialPayment {
    pub amount: f64,
    pub payment_method: PaymentMethod,
    /// Product ids of the lines this payment covers.
    #[serde(default, rename = "paid_products")]
    pub paid_lines: Vec<String>,
    #[serde(with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub table_number: u32,
    #[serde(default)]
    pub zone: Option<Zone>,
    pub waiter_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(rename = "products", default)]
    pub lines: Vec<OrderLine>,
    pub total: f64,
    #[serde(default)]
    pub paid_amount: f64,
    #[serde(default)]
    pub pending_amount: f64,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub partial_payments: Vec<PartialPayment>,
    #[serde(rename = "special_note", default)]
    pub note: Option<String>,
    #[serde(with = "utc_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "utc_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unified_with: Option<Vec<String>>,
}

impl Order {
    /// Sum of `price * quantity` over every line, rounded to cents.
    pub fn lines_total(&self) -> f64 {
        round_currency(self.lines.iter().map(OrderLine::subtotal).sum())
    }

    /// Orders stored before zones existed belong to the exterior terrace.
    pub fn effective_zone(&self) -> Zone {
        self.zone.unwrap_or(Zone::ExteriorTerrace)
    }

    /// Re-derive the payment figures so that `paid + pending == total` and
    /// `paid == sum(partial_payments)`. The total itself is taken as given.
    pub fn normalize(&mut self) {
        for line in &mut self.lines {
            if line.original_price <= 0.0 {
                line.original_price = line.price;
            }
        }
        if !self.partial_payments.is_empty() {
            self.paid_amount = round_currency(self.partial_payments.iter().map(|p| p.amount).sum());
        }
        self.paid_amount = round_currency(self.paid_amount.max(0.0));
        self.pending_amount = round_currency((self.total - self.paid_amount).max(0.0));
    }

    pub fn is_balanced(&self) -> bool {
        (self.paid_amount + self.pending_amount - self.total).abs() < CURRENCY_EPSILON
    }

    /// Full representation for `PUT /orders/{id}`; the backend has no
    /// partial-patch semantics.
    pub fn to_payload(&self) -> OrderPayload {
        OrderPayload {
            table_number: self.table_number,
            zone: Some(self.effective_zone()),
            waiter_role: self.waiter_role,
            lines: self.lines.clone(),
            total: self.total,
            paid_amount: self.paid_amount,
            pending_amount: self.pending_amount,
            status: self.status,
            payment_method: self.payment_method,
            partial_payments: self.partial_payments.clone(),
            note: self.note.clone(),
            unified_with: self.unified_with.clone(),
        }
    }

    pub fn with_status(&self, status: OrderStatus) -> Order {
        let mut next = self.clone();
        next.status = status;
        next
    }

    /// Override the price of every line for `product_id` and recompute the
    /// total from the lines. The new total may not drop below what has
    /// already been paid.
    pub fn with_line_price(&self, product_id: &str, price: f64) -> Result<Order> {
        if !price.is_finite() || price < 0.0 {
            return Err(SyncError::InvalidPrice(price));
        }
        let mut next = self.clone();
        let mut touched = false;
        for line in next.lines.iter_mut().filter(|l| l.product_id == product_id) {
            if line.original_price <= 0.0 {
                line.original_price = line.price;
            }
            line.price = price;
            touched = true;
        }
        if !touched {
            return Err(SyncError::UnknownLine(product_id.to_string()));
        }
        next.total = next.lines_total();
        next.normalize();
        if next.total < next.paid_amount - CURRENCY_EPSILON {
            return Err(SyncError::TotalBelowPaid {
                total: next.total,
                paid: next.paid_amount,
            });
        }
        Ok(next)
    }

    /// Record a partial payment locally: mark the selected lines paid,
    /// append the payment and move money from pending to paid.
    pub fn apply_partial_payment(
        &self,
        request: &PartialPaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<(Order, PartialPayment)> {
        let (amount, paid_lines) = match &request.selection {
            PaymentSelection::Lines(ids) => {
                if ids.is_empty() {
                    return Err(SyncError::InvalidPayment("no lines selected".into()));
                }
                let amount: f64 = self
                    .lines
                    .iter()
                    .filter(|l| !l.is_paid && ids.contains(&l.product_id))
                    .map(OrderLine::subtotal)
                    .sum();
                (round_currency(amount), ids.clone())
            }
            PaymentSelection::Amount(amount) => (round_currency(*amount), Vec::new()),
        };

        if !amount.is_finite() || amount <= 0.0 {
            return Err(SyncError::InvalidPayment(format!(
                "amount must be positive, got {amount:.2}"
            )));
        }
        if amount > self.pending_amount + CURRENCY_EPSILON {
            return Err(SyncError::InvalidPayment(format!(
                "amount {amount:.2} exceeds pending {:.2}",
                self.pending_amount
            )));
        }

        let payment = PartialPayment {
            amount,
            payment_method: request.payment_method,
            paid_lines: paid_lines.clone(),
            timestamp: now,
            note: request.note.clone(),
        };

        let mut next = self.clone();
        for line in next.lines.iter_mut() {
            if paid_lines.contains(&line.product_id) {
                line.is_paid = true;
            }
        }
        next.paid_amount = round_currency(self.paid_amount + amount);
        next.pending_amount = round_currency((next.total - next.paid_amount).max(0.0));
        next.payment_method = Some(request.payment_method);
        next.partial_payments.push(payment.clone());
        Ok((next, payment))
    }
}

/// Body of order create/update requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub table_number: u32,
    pub zone: Option<Zone>,
    pub waiter_role: Role,
    #[serde(rename = "products")]
    pub lines: Vec<OrderLine>,
    pub total: f64,
    pub paid_amount: f64,
    pub pending_amount: f64,
    pub status: OrderStatus,
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub partial_payments: Vec<PartialPayment>,
    #[serde(rename = "special_note", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unified_with: Option<Vec<String>>,
}

/// What the new-order screen collects.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub table_number: u32,
    pub zone: Zone,
    pub lines: Vec<OrderLine>,
    pub payment_method: Option<PaymentMethod>,
    pub note: Option<String>,
    /// Defaults to the active role when absent.
    pub waiter_role: Option<Role>,
}

impl NewOrder {
    pub fn into_payload(self, role: Role) -> OrderPayload {
        let total = round_currency(self.lines.iter().map(OrderLine::subtotal).sum());
        OrderPayload {
            table_number: self.table_number,
            zone: Some(self.zone),
            waiter_role: self.waiter_role.unwrap_or(role),
            lines: self.lines,
            total,
            paid_amount: 0.0,
            pending_amount: total,
            status: OrderStatus::Pending,
            payment_method: self.payment_method,
            partial_payments: Vec::new(),
            note: self.note.filter(|n| !n.trim().is_empty()),
            unified_with: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentSelection {
    /// Pay the unpaid lines of these product ids.
    Lines(Vec<String>),
    /// Pay a free amount without attributing it to lines.
    Amount(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialPaymentRequest {
    pub selection: PaymentSelection,
    pub payment_method: PaymentMethod,
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// Category name, not id.
    pub category: String,
    pub price: f64,
    #[serde(with = "utc_timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub name: String,
    pub category: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(with = "utc_timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPayload {
    pub name: String,
    pub icon: String,
}

/// Anything kept in a canonical id-keyed collection.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Order {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Product {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Category {
    fn key(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Daily closures and statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneTotals {
    #[serde(default)]
    pub sales: f64,
    #[serde(default)]
    pub orders: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    #[serde(default, with = "utc_timestamp::option", skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_sales: f64,
    #[serde(default)]
    pub cash_sales: f64,
    #[serde(default)]
    pub card_sales: f64,
    #[serde(default)]
    pub mixed_sales: f64,
    #[serde(default)]
    pub total_orders: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_zone: Option<BTreeMap<Zone, ZoneTotals>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeeklyStats {
    #[serde(default)]
    pub total_sales: f64,
    #[serde(default)]
    pub total_orders: u32,
    #[serde(default)]
    pub days: Vec<DailyStats>,
}

/// End-of-day cash closure. Historical and append-only; the backend owns
/// any per-day uniqueness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyClosure {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(with = "utc_timestamp")]
    pub date: DateTime<Utc>,
    pub total_sales: f64,
    pub cash_sales: f64,
    pub card_sales: f64,
    #[serde(default)]
    pub mixed_sales: f64,
    pub total_orders: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_zone: Option<BTreeMap<Zone, ZoneTotals>>,
    pub closed_by: String,
}

impl DailyClosure {
    pub fn from_stats(stats: &DailyStats, closed_by: &str, date: DateTime<Utc>) -> Self {
        Self {
            id: None,
            date,
            total_sales: stats.total_sales,
            cash_sales: stats.cash_sales,
            card_sales: stats.card_sales,
            mixed_sales: stats.mixed_sales,
            total_orders: stats.total_orders,
            by_zone: stats.by_zone.clone(),
            closed_by: closed_by.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub onesignal_app_id: Option<String>,
    #[serde(default)]
    pub onesignal_api_key: Option<String>,
    #[serde(default, with = "utc_timestamp::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Staff alert pushed over the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub role: Role,
    pub message: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ===========================================================================
// Tests
// ===========================================================================
