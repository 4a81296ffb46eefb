//! Synchronization core.
//!
//! Owns the canonical order/product/category collections for the active
//! role and keeps them consistent across three sources: REST responses,
//! events pushed over the live stream, and the offline cache used when the
//! backend is unreachable.
//!
//! Two write paths exist on purpose:
//! - create/delete (and catalog updates) only talk to the backend; canonical
//!   state changes when the matching stream event is merged.
//! - order updates and partial payments merge the server response
//!   immediately.
//!
//! Canonical state sits behind a std `Mutex` that is never held across an
//! await. Each role selection bumps a generation counter; a refresh started
//! under an older generation is discarded when it lands.

use chrono::{NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Backend;
use crate::error::{Result, SyncError};
use crate::events::RemoteEvent;
use crate::models::{
    Category, CategoryPayload, DailyClosure, DailyStats, Keyed, NewOrder, Notification, Order,
    OrderPayload, OrderStatus, PartialPaymentRequest, Product, ProductPayload, Role, Settings,
    WeeklyStats, Zone,
};
use crate::offline::{LocalCache, Snapshot};
use crate::realtime::{StreamConfig, StreamMessage, StreamSlot};

const SIGNAL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What the UI layer is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum UiSignal {
    /// Canonical collections or flags changed; re-read the read model.
    StateChanged,
    /// A staff notification addressed to the active role.
    Notification(Notification),
    /// One of the active role's orders reached `listo`.
    OrderReady { order_id: String, table_number: u32 },
    ConnectivityChanged { online: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Fresh data from the backend replaced canonical state.
    Online,
    /// Backend unreachable; canonical state reloaded from the offline cache.
    Offline { reason: String },
    /// The role changed while the fetch was in flight; result dropped.
    Superseded,
    /// No role selected.
    Inactive,
}

/// Result of merging one remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Duplicate delete, or a notification for another role.
    Ignored,
    Surfaced,
    RefreshScheduled,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct State {
    role: Option<Role>,
    generation: u64,
    orders: HashMap<String, Order>,
    products: HashMap<String, Product>,
    categories: HashMap<String, Category>,
    online: bool,
    busy: bool,
    live: bool,
    /// Collections hold a complete snapshot (a refresh landed for this
    /// generation). Merges are only written through to the cache when set.
    synced: bool,
}

impl State {
    fn new() -> Self {
        Self {
            role: None,
            generation: 0,
            orders: HashMap::new(),
            products: HashMap::new(),
            categories: HashMap::new(),
            online: true,
            busy: false,
            live: false,
            synced: false,
        }
    }

    fn replace(&mut self, snapshot: Snapshot) {
        self.orders = index(snapshot.orders.into_iter().map(normalized));
        self.products = index(snapshot.products);
        self.categories = index(snapshot.categories);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            orders: self.orders.values().cloned().collect(),
            products: self.products.values().cloned().collect(),
            categories: self.categories.values().cloned().collect(),
        }
    }

    fn clear(&mut self) {
        self.orders.clear();
        self.products.clear();
        self.categories.clear();
        self.synced = false;
    }
}

fn index<T: Keyed>(items: impl IntoIterator<Item = T>) -> HashMap<String, T> {
    items
        .into_iter()
        .map(|item| (item.key().to_string(), item))
        .collect()
}

fn upsert<T: Keyed>(map: &mut HashMap<String, T>, item: T) -> MergeOutcome {
    match map.insert(item.key().to_string(), item) {
        Some(_) => MergeOutcome::Replaced,
        None => MergeOutcome::Inserted,
    }
}

fn remove<T>(map: &mut HashMap<String, T>, id: &str) -> MergeOutcome {
    match map.remove(id) {
        Some(_) => MergeOutcome::Removed,
        None => MergeOutcome::Ignored,
    }
}

/// Server totals are authoritative; only the payment split is re-derived.
fn normalized(mut order: Order) -> Order {
    order.normalize();
    order
}

struct InFlight {
    id: u64,
    generation: u64,
    fut: Shared<BoxFuture<'static, RefreshOutcome>>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    cache: LocalCache,
    stream_config: Option<StreamConfig>,
    stream: StreamSlot,
    state: Mutex<State>,
    inflight: Mutex<Option<InFlight>>,
    next_refresh_id: AtomicU64,
    switch_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    signals: broadcast::Sender<UiSignal>,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle to the synchronization core.
#[derive(Clone)]
pub struct SyncCore {
    inner: Arc<Inner>,
}

impl SyncCore {
    /// `stream_config` of `None` runs without live updates.
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: LocalCache,
        stream_config: Option<StreamConfig>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                cache,
                stream_config,
                stream: StreamSlot::new(),
                state: Mutex::new(State::new()),
                inflight: Mutex::new(None),
                next_refresh_id: AtomicU64::new(1),
                switch_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                event_task: Mutex::new(None),
                signals,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiSignal> {
        self.inner.signals.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, signal: UiSignal) {
        // No receivers is fine.
        let _ = self.inner.signals.send(signal);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    // -----------------------------------------------------------------------
    // Role
    // -----------------------------------------------------------------------

    /// Activate `role`: persist it, reset canonical state, reopen the stream
    /// scoped to it and run a full refresh.
    pub async fn select_role(&self, role: Role) -> RefreshOutcome {
        {
            let _switch = self.inner.switch_lock.lock().await;
            let generation = {
                let mut st = self.state();
                st.role = Some(role);
                st.generation += 1;
                st.live = false;
                st.clear();
                st.generation
            };
            info!(%role, generation, "role selected");

            if let Err(e) = self.inner.cache.save_role(role).await {
                warn!(%role, error = %e, "failed to persist selected role");
            }
            self.open_stream(role, generation).await;
        }
        self.emit(UiSignal::StateChanged);
        self.refresh().await
    }

    /// Re-select the role stored in the offline cache, if any.
    pub async fn restore_role(&self) -> Option<Role> {
        let role = self.inner.cache.load_role().await?;
        info!(%role, "restoring cached role");
        self.select_role(role).await;
        Some(role)
    }

    pub fn active_role(&self) -> Option<Role> {
        self.state().role
    }

    pub fn username(&self) -> Option<&'static str> {
        self.active_role().map(|r| r.username())
    }

    fn require_role(&self) -> Result<Role> {
        self.active_role().ok_or(SyncError::NoActiveRole)
    }

    /// Close the stream and stop the event loop.
    pub async fn shutdown(&self) {
        let task = self
            .inner
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.stream.close().await;
        self.state().live = false;
    }

    // -----------------------------------------------------------------------
    // Stream
    // -----------------------------------------------------------------------

    async fn open_stream(&self, role: Role, generation: u64) {
        let Some(config) = self.inner.stream_config.clone() else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.stream.open(config, role, tx).await;

        let core = self.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !core.is_current(generation) {
                    break;
                }
                core.handle_stream_message(message).await;
            }
            debug!(%role, generation, "stream event loop finished");
        });

        let previous = self
            .inner
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn handle_stream_message(&self, message: StreamMessage) {
        match message {
            StreamMessage::Connected { reconnect } => {
                self.state().live = true;
                if reconnect {
                    info!("stream reconnected, catching up");
                    self.spawn_refresh("stream reconnect");
                }
            }
            StreamMessage::Disconnected => {
                self.state().live = false;
            }
            StreamMessage::GaveUp => {
                self.state().live = false;
                warn!("live updates stopped; refresh manually to resync");
            }
            StreamMessage::Event(event) => {
                self.apply_remote_event(event).await;
            }
        }
    }

    fn spawn_refresh(&self, reason: &'static str) {
        let core = self.clone();
        tokio::spawn(async move {
            let outcome = core.refresh().await;
            debug!(reason, ?outcome, "background refresh finished");
        });
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Fetch all three collections. Concurrent callers under the same role
    /// share a single in-flight fetch.
    pub async fn refresh(&self) -> RefreshOutcome {
        let generation = {
            let st = self.state();
            match st.role {
                Some(_) => st.generation,
                None => return RefreshOutcome::Inactive,
            }
        };

        let fut = {
            let mut slot = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let running = slot
                .as_ref()
                .filter(|f| f.generation == generation)
                .map(|f| f.fut.clone());
            match running {
                Some(fut) => {
                    debug!(generation, "joining in-flight refresh");
                    fut
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let fut = self.clone().run_refresh(id, generation).boxed().shared();
                    *slot = Some(InFlight {
                        id,
                        generation,
                        fut: fut.clone(),
                    });
                    fut
                }
            }
        };

        fut.await
    }

    async fn run_refresh(self, id: u64, generation: u64) -> RefreshOutcome {
        {
            let mut st = self.state();
            if st.generation == generation {
                st.busy = true;
            }
        }

        let backend = &self.inner.backend;
        let fetched = tokio::join!(
            backend.list_orders(),
            backend.list_products(),
            backend.list_categories()
        );

        let outcome = match fetched {
            (Ok(orders), Ok(products), Ok(categories)) => {
                let snapshot = Snapshot {
                    orders,
                    products,
                    categories,
                };
                if self.apply_refresh(generation, snapshot, true) {
                    RefreshOutcome::Online
                } else {
                    RefreshOutcome::Superseded
                }
            }
            (orders, products, categories) => {
                let reason = [orders.err(), products.err(), categories.err()]
                    .into_iter()
                    .flatten()
                    .next()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(%reason, "refresh failed, falling back to offline cache");
                let cached = self.inner.cache.load_snapshot().await;
                if self.apply_refresh(generation, cached, false) {
                    RefreshOutcome::Offline { reason }
                } else {
                    RefreshOutcome::Superseded
                }
            }
        };

        if outcome == RefreshOutcome::Online {
            self.persist().await;
        }

        let mut slot = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|f| f.id) == Some(id) {
            *slot = None;
        }
        outcome
    }

    /// Replace canonical state wholesale if `generation` is still current.
    /// Returns false when the result belongs to a previous role.
    fn apply_refresh(&self, generation: u64, snapshot: Snapshot, online: bool) -> bool {
        let (counts, flipped) = {
            let mut st = self.state();
            if st.generation != generation {
                info!(generation, current = st.generation, "discarding refresh for a previous role");
                return false;
            }
            st.replace(snapshot);
            st.synced = true;
            st.busy = false;
            let flipped = st.online != online;
            st.online = online;
            (
                (st.orders.len(), st.products.len(), st.categories.len()),
                flipped,
            )
        };

        info!(
            online,
            orders = counts.0,
            products = counts.1,
            categories = counts.2,
            "canonical state refreshed"
        );
        if flipped {
            self.emit(UiSignal::ConnectivityChanged { online });
        }
        self.emit(UiSignal::StateChanged);
        true
    }

    /// Write the current canonical state to the offline cache. Writers are
    /// serialized and each writes the state as of taking the lock. Nothing is
    /// written until a refresh has landed for the current role, so a merge
    /// into the cleared collections of a fresh role selection never replaces
    /// the last complete snapshot.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = {
            let st = self.state();
            if !st.synced {
                debug!(generation = st.generation, "no complete snapshot yet, skipping persist");
                return;
            }
            st.snapshot()
        };
        if let Err(e) = self.inner.cache.save_snapshot(&snapshot).await {
            warn!(error = %e, "failed to persist offline snapshot");
        }
    }

    // -----------------------------------------------------------------------
    // Event merge
    // -----------------------------------------------------------------------

    /// Merge one remote event into canonical state.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> MergeOutcome {
        let name = event.name();
        let mut signals = Vec::new();

        let outcome = {
            let mut st = self.state();
            let active = st.role;
            match event {
                RemoteEvent::OrderCreated(order) => upsert(&mut st.orders, normalized(order)),
                RemoteEvent::OrderUpdated(order) => {
                    let order = normalized(order);
                    let was_ready = st
                        .orders
                        .get(&order.id)
                        .map(|o| o.status == OrderStatus::Ready)
                        .unwrap_or(false);
                    if order.status == OrderStatus::Ready
                        && !was_ready
                        && Some(order.waiter_role) == active
                    {
                        signals.push(UiSignal::OrderReady {
                            order_id: order.id.clone(),
                            table_number: order.table_number,
                        });
                    }
                    upsert(&mut st.orders, order)
                }
                RemoteEvent::OrderDeleted { order_id } => remove(&mut st.orders, &order_id),
                RemoteEvent::ProductCreated(p) | RemoteEvent::ProductUpdated(p) => {
                    upsert(&mut st.products, p)
                }
                RemoteEvent::ProductDeleted { product_id } => remove(&mut st.products, &product_id),
                RemoteEvent::CategoryCreated(c) | RemoteEvent::CategoryUpdated(c) => {
                    upsert(&mut st.categories, c)
                }
                RemoteEvent::CategoryDeleted { category_id } => {
                    remove(&mut st.categories, &category_id)
                }
                RemoteEvent::Notification(notification) => {
                    if Some(notification.role) == active {
                        signals.push(UiSignal::Notification(notification));
                        MergeOutcome::Surfaced
                    } else {
                        MergeOutcome::Ignored
                    }
                }
                RemoteEvent::DailyClosureCreated(_) => MergeOutcome::RefreshScheduled,
            }
        };

        debug!(event = name, ?outcome, "remote event merged");

        match outcome {
            MergeOutcome::Inserted | MergeOutcome::Replaced | MergeOutcome::Removed => {
                self.emit(UiSignal::StateChanged);
                for signal in signals {
                    self.emit(signal);
                }
                self.persist().await;
            }
            MergeOutcome::Surfaced => {
                for signal in signals {
                    self.emit(signal);
                }
            }
            MergeOutcome::RefreshScheduled => self.spawn_refresh(name),
            MergeOutcome::Ignored => {}
        }
        outcome
    }

    /// Merge an order returned by a successful update.
    async fn merge_response(&self, order: Order) -> Order {
        let order = normalized(order);
        upsert(&mut self.state().orders, order.clone());
        self.emit(UiSignal::StateChanged);
        self.persist().await;
        order
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Create an order for the active role. Canonical state is updated by
    /// the `order_created` event, not here.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order> {
        let role = self.require_role()?;
        let payload = new_order.into_payload(role);
        let order = self
            .inner
            .backend
            .create_order(&payload)
            .await
            .map_err(|e| e.into_mutation("create order"))?;
        info!(order_id = %order.id, table = order.table_number, "order created");
        Ok(order)
    }

    /// Replace an order on the backend and merge the response.
    pub async fn update_order(&self, id: &str, payload: &OrderPayload) -> Result<Order> {
        let order = self
            .inner
            .backend
            .update_order(id, payload)
            .await
            .map_err(|e| e.into_mutation("update order"))?;
        debug!(order_id = %id, status = ?order.status, "order updated");
        Ok(self.merge_response(order).await)
    }

    /// Removal happens when `order_deleted` is merged.
    pub async fn delete_order(&self, id: &str) -> Result<()> {
        self.inner
            .backend
            .delete_order(id)
            .await
            .map_err(|e| e.into_mutation("delete order"))?;
        info!(order_id = %id, "order deleted");
        Ok(())
    }

    fn known_order(&self, id: &str) -> Result<Order> {
        self.order(id)
            .ok_or_else(|| SyncError::UnknownOrder(id.to_string()))
    }

    pub async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order> {
        let order = self.known_order(id)?;
        self.update_order(id, &order.with_status(status).to_payload())
            .await
    }

    /// Override the price of one product's lines; the total is recomputed
    /// from the lines before sending.
    pub async fn override_line_price(&self, id: &str, product_id: &str, price: f64) -> Result<Order> {
        let edited = self.known_order(id)?.with_line_price(product_id, price)?;
        self.update_order(id, &edited.to_payload()).await
    }

    /// Record a partial payment: the payment is appended locally and the
    /// full order is sent, then the response is merged like any update.
    pub async fn record_partial_payment(
        &self,
        id: &str,
        request: PartialPaymentRequest,
    ) -> Result<Order> {
        let order = self.known_order(id)?;
        let (paid, payment) = order.apply_partial_payment(&request, Utc::now())?;
        info!(
            order_id = %id,
            amount = payment.amount,
            method = ?payment.payment_method,
            "recording partial payment"
        );
        self.update_order(id, &paid.to_payload()).await
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    pub async fn create_product(&self, payload: &ProductPayload) -> Result<Product> {
        self.inner
            .backend
            .create_product(payload)
            .await
            .map_err(|e| e.into_mutation("create product"))
    }

    pub async fn update_product(&self, id: &str, payload: &ProductPayload) -> Result<Product> {
        self.inner
            .backend
            .update_product(id, payload)
            .await
            .map_err(|e| e.into_mutation("update product"))
    }

    pub async fn delete_product(&self, id: &str) -> Result<()> {
        self.inner
            .backend
            .delete_product(id)
            .await
            .map_err(|e| e.into_mutation("delete product"))?;
        Ok(())
    }

    pub async fn create_category(&self, payload: &CategoryPayload) -> Result<Category> {
        self.inner
            .backend
            .create_category(payload)
            .await
            .map_err(|e| e.into_mutation("create category"))
    }

    pub async fn update_category(&self, id: &str, payload: &CategoryPayload) -> Result<Category> {
        self.inner
            .backend
            .update_category(id, payload)
            .await
            .map_err(|e| e.into_mutation("update category"))
    }

    pub async fn delete_category(&self, id: &str) -> Result<()> {
        self.inner
            .backend
            .delete_category(id)
            .await
            .map_err(|e| e.into_mutation("delete category"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Aggregates and admin
    // -----------------------------------------------------------------------

    pub async fn daily_stats(&self, date: Option<NaiveDate>) -> Result<DailyStats> {
        self.inner.backend.daily_stats(date).await
    }

    pub async fn weekly_stats(&self) -> Result<WeeklyStats> {
        self.inner.backend.weekly_stats().await
    }

    pub async fn daily_closures(&self, limit: u32) -> Result<Vec<DailyClosure>> {
        self.inner.backend.daily_closures(limit).await
    }

    /// Close the current business day from today's server-side stats.
    pub async fn close_day(&self, closed_by: &str) -> Result<DailyClosure> {
        let stats = self
            .inner
            .backend
            .daily_stats(None)
            .await
            .map_err(|e| e.into_mutation("close day"))?;
        let closure = DailyClosure::from_stats(&stats, closed_by, Utc::now());
        let created = self
            .inner
            .backend
            .create_daily_closure(&closure)
            .await
            .map_err(|e| e.into_mutation("close day"))?;
        info!(
            closed_by,
            total_sales = created.total_sales,
            orders = created.total_orders,
            "daily closure created"
        );
        Ok(created)
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.inner.backend.settings().await
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        self.inner
            .backend
            .update_settings(settings)
            .await
            .map_err(|e| e.into_mutation("update settings"))
    }

    /// Load the backend's demo catalog, then refresh.
    pub async fn seed(&self) -> Result<Value> {
        let result = self
            .inner
            .backend
            .seed()
            .await
            .map_err(|e| e.into_mutation("seed"))?;
        self.refresh().await;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    /// Whether the live stream is currently connected.
    pub fn is_live(&self) -> bool {
        self.state().live
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state().snapshot()
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.state().orders.get(id).cloned()
    }

    /// Newest first.
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.state().orders.values().cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        self.orders()
            .into_iter()
            .filter(|o| o.status == status)
            .collect()
    }

    pub fn orders_in_zone(&self, zone: Zone) -> Vec<Order> {
        self.orders()
            .into_iter()
            .filter(|o| o.effective_zone() == zone)
            .collect()
    }

    /// Sorted by name.
    pub fn products(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.state().products.values().cloned().collect();
        products.sort_by(|a, b| a.name.cmp(&b.name));
        products
    }

    pub fn products_in_category(&self, category: &str) -> Vec<Product> {
        self.products()
            .into_iter()
            .filter(|p| p.category == category)
            .collect()
    }

    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = self.state().categories.values().cloned().collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        categories
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderLine, PaymentMethod, PaymentSelection};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn product(id: &str, price: f64) -> Product {
        Product {
            id: id.into(),
            name: format!("Producto {id}"),
            category: "comida".into(),
            price,
            created_at: ts(0),
        }
    }

    fn category(id: &str, name: &str) -> Category {
        Category {
            id: id.into(),
            name: name.into(),
            icon: "restaurant".into(),
            created_at: ts(0),
        }
    }

    fn order_from_payload(id: &str, payload: &OrderPayload, minute: u32) -> Order {
        Order {
            id: id.into(),
            table_number: payload.table_number,
            zone: payload.zone,
            waiter_role: payload.waiter_role,
            created_by: None,
            lines: payload.lines.clone(),
            total: payload.total,
            paid_amount: payload.paid_amount,
            pending_amount: payload.pending_amount,
            status: payload.status,
            payment_method: payload.payment_method,
            partial_payments: payload.partial_payments.clone(),
            note: payload.note.clone(),
            created_at: ts(minute),
            updated_at: ts(minute),
            unified_with: payload.unified_with.clone(),
        }
    }

    fn order(id: &str, table: u32, role: Role, minute: u32) -> Order {
        let payload = NewOrder {
            table_number: table,
            zone: Zone::InteriorLounge,
            lines: vec![OrderLine::from_product(&product("p1", 10.0), 2)],
            payment_method: Some(PaymentMethod::Cash),
            note: None,
            waiter_role: Some(role),
        }
        .into_payload(role);
        order_from_payload(id, &payload, minute)
    }

    fn offline_error() -> SyncError {
        SyncError::TransportUnavailable("cannot reach backend at http://test".into())
    }

    // -----------------------------------------------------------------------
    // Mock backend
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct MockBackend {
        orders: Mutex<Vec<Order>>,
        products: Mutex<Vec<Product>>,
        categories: Mutex<Vec<Category>>,
        offline: AtomicBool,
        fail_products: AtomicBool,
        fail_writes: AtomicBool,
        list_order_calls: AtomicUsize,
        /// Taken by the next `list_orders`, which waits on it after reading.
        hold: Mutex<Option<Arc<Notify>>>,
        created: Mutex<Vec<OrderPayload>>,
        updated: Mutex<Vec<(String, OrderPayload)>>,
        closures: Mutex<Vec<DailyClosure>>,
    }

    impl MockBackend {
        fn check_read(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(offline_error());
            }
            Ok(())
        }

        fn check_write(&self) -> Result<()> {
            self.check_read()?;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SyncError::Http {
                    status: 500,
                    message: "Backend server error".into(),
                });
            }
            Ok(())
        }

        fn set_orders(&self, orders: Vec<Order>) {
            *self.orders.lock().unwrap() = orders;
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn list_orders(&self) -> Result<Vec<Order>> {
            self.list_order_calls.fetch_add(1, Ordering::SeqCst);
            self.check_read()?;
            let data = self.orders.lock().unwrap().clone();
            let hold = self.hold.lock().unwrap().take();
            if let Some(gate) = hold {
                gate.notified().await;
            }
            Ok(data)
        }

        async fn create_order(&self, order: &OrderPayload) -> Result<Order> {
            self.check_write()?;
            self.created.lock().unwrap().push(order.clone());
            Ok(order_from_payload("srv-new", order, 30))
        }

        async fn update_order(&self, id: &str, order: &OrderPayload) -> Result<Order> {
            self.check_write()?;
            self.updated
                .lock()
                .unwrap()
                .push((id.to_string(), order.clone()));
            Ok(order_from_payload(id, order, 0))
        }

        async fn delete_order(&self, _id: &str) -> Result<Value> {
            self.check_write()?;
            Ok(json!({"message": "Order deleted"}))
        }

        async fn add_partial_payment(
            &self,
            _id: &str,
            _payment: &crate::models::PartialPayment,
        ) -> Result<Order> {
            Err(SyncError::Http {
                status: 404,
                message: "Resource not found".into(),
            })
        }

        async fn list_products(&self) -> Result<Vec<Product>> {
            self.check_read()?;
            if self.fail_products.load(Ordering::SeqCst) {
                return Err(SyncError::Http {
                    status: 503,
                    message: "Backend server error".into(),
                });
            }
            Ok(self.products.lock().unwrap().clone())
        }

        async fn create_product(&self, product: &ProductPayload) -> Result<Product> {
            self.check_write()?;
            Ok(Product {
                id: "p-new".into(),
                name: product.name.clone(),
                category: product.category.clone(),
                price: product.price,
                created_at: ts(0),
            })
        }

        async fn update_product(&self, id: &str, product: &ProductPayload) -> Result<Product> {
            self.check_write()?;
            Ok(Product {
                id: id.into(),
                name: product.name.clone(),
                category: product.category.clone(),
                price: product.price,
                created_at: ts(0),
            })
        }

        async fn delete_product(&self, _id: &str) -> Result<Value> {
            self.check_write()?;
            Ok(json!({"message": "Product deleted"}))
        }

        async fn list_categories(&self) -> Result<Vec<Category>> {
            self.check_read()?;
            Ok(self.categories.lock().unwrap().clone())
        }

        async fn create_category(&self, c: &CategoryPayload) -> Result<Category> {
            self.check_write()?;
            Ok(category("c-new", &c.name))
        }

        async fn update_category(&self, id: &str, c: &CategoryPayload) -> Result<Category> {
            self.check_write()?;
            Ok(category(id, &c.name))
        }

        async fn delete_category(&self, _id: &str) -> Result<Value> {
            self.check_write()?;
            Ok(json!({"message": "Category deleted"}))
        }

        async fn daily_stats(&self, _date: Option<NaiveDate>) -> Result<DailyStats> {
            self.check_read()?;
            Ok(DailyStats {
                total_sales: 120.0,
                cash_sales: 70.0,
                card_sales: 50.0,
                total_orders: 8,
                ..Default::default()
            })
        }

        async fn weekly_stats(&self) -> Result<WeeklyStats> {
            self.check_read()?;
            Ok(WeeklyStats::default())
        }

        async fn daily_closures(&self, limit: u32) -> Result<Vec<DailyClosure>> {
            self.check_read()?;
            let closures = self.closures.lock().unwrap();
            Ok(closures.iter().take(limit as usize).cloned().collect())
        }

        async fn create_daily_closure(&self, closure: &DailyClosure) -> Result<DailyClosure> {
            self.check_write()?;
            let mut created = closure.clone();
            created.id = Some("dc1".into());
            self.closures.lock().unwrap().push(created.clone());
            Ok(created)
        }

        async fn settings(&self) -> Result<Settings> {
            self.check_read()?;
            Ok(Settings::default())
        }

        async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
            self.check_write()?;
            Ok(settings.clone())
        }

        async fn seed(&self) -> Result<Value> {
            self.check_write()?;
            Ok(json!({"message": "Data seeded successfully"}))
        }
    }

    fn core_with(backend: Arc<MockBackend>) -> SyncCore {
        SyncCore::new(backend, LocalCache::in_memory().unwrap(), None)
    }

    fn seeded_backend() -> Arc<MockBackend> {
        let backend = MockBackend::default();
        backend.set_orders(vec![
            order("o1", 1, Role::Bar, 1),
            order("o2", 2, Role::Waiter1, 5),
        ]);
        *backend.products.lock().unwrap() = vec![product("p1", 10.0), product("p2", 3.5)];
        *backend.categories.lock().unwrap() = vec![category("c1", "comida")];
        Arc::new(backend)
    }

    fn drain(rx: &mut broadcast::Receiver<UiSignal>) -> Vec<UiSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    // -----------------------------------------------------------------------
    // Role and refresh
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_refresh_without_role_is_inactive() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        assert_eq!(core.refresh().await, RefreshOutcome::Inactive);
        assert_eq!(backend.list_order_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_select_role_loads_and_persists() {
        let backend = seeded_backend();
        let cache = LocalCache::in_memory().unwrap();
        let core = SyncCore::new(backend, cache.clone(), None);

        assert_eq!(core.select_role(Role::Bar).await, RefreshOutcome::Online);
        assert_eq!(core.active_role(), Some(Role::Bar));
        assert_eq!(core.username(), Some("usuario1"));
        assert!(core.is_online());
        assert!(!core.is_busy());
        assert_eq!(core.orders().len(), 2);
        // newest first
        assert_eq!(core.orders()[0].id, "o2");

        assert_eq!(cache.load_role().await, Some(Role::Bar));
        let persisted = cache.load_snapshot().await;
        assert_eq!(persisted.orders.len(), 2);
        assert_eq!(persisted.products.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_role_from_cache() {
        let backend = seeded_backend();
        let cache = LocalCache::in_memory().unwrap();
        cache.save_role(Role::Waiter2).await.unwrap();
        let core = SyncCore::new(backend, cache, None);

        assert_eq!(core.restore_role().await, Some(Role::Waiter2));
        assert_eq!(core.active_role(), Some(Role::Waiter2));
        assert_eq!(core.products().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_role_without_cached_role() {
        let core = core_with(seeded_backend());
        assert_eq!(core.restore_role().await, None);
        assert_eq!(core.active_role(), None);
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back_to_cache() {
        let backend = seeded_backend();
        let cache = LocalCache::in_memory().unwrap();
        let core = SyncCore::new(backend.clone(), cache, None);
        let mut rx = core.subscribe();

        core.select_role(Role::Bar).await;
        let cached = core.snapshot();
        drain(&mut rx);

        backend.offline.store(true, Ordering::SeqCst);
        let outcome = core.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Offline { .. }));
        assert!(!core.is_online());

        let mut ids: Vec<String> = core.orders().into_iter().map(|o| o.id).collect();
        ids.sort();
        let mut expected: Vec<String> = cached.orders.into_iter().map(|o| o.id).collect();
        expected.sort();
        assert_eq!(ids, expected);

        let signals = drain(&mut rx);
        assert!(signals.contains(&UiSignal::ConnectivityChanged { online: false }));
    }

    #[tokio::test]
    async fn test_partial_refresh_failure_never_mixes_new_data() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;

        // New orders are available, but products fail: nothing new may land.
        backend.set_orders(vec![order("o9", 9, Role::Bar, 40)]);
        backend.fail_products.store(true, Ordering::SeqCst);

        let outcome = core.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Offline { .. }));
        assert!(core.order("o9").is_none());
        assert!(core.order("o1").is_some());
        assert_eq!(core.products().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_start_with_empty_cache_is_empty() {
        let backend = seeded_backend();
        backend.offline.store(true, Ordering::SeqCst);
        let core = core_with(backend);

        let outcome = core.select_role(Role::Admin).await;
        assert!(matches!(outcome, RefreshOutcome::Offline { .. }));
        assert!(core.orders().is_empty());
        assert!(core.products().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        let gate = Arc::new(Notify::new());
        *backend.hold.lock().unwrap() = Some(gate.clone());

        let first = tokio::spawn({
            let core = core.clone();
            async move { core.select_role(Role::Bar).await }
        });
        wait_until(|| backend.list_order_calls.load(Ordering::SeqCst) == 1).await;
        assert!(core.is_busy());

        let (second, third, _) = tokio::join!(core.refresh(), core.refresh(), async {
            gate.notify_one();
        });

        assert_eq!(second, RefreshOutcome::Online);
        assert_eq!(third, RefreshOutcome::Online);
        assert_eq!(first.await.unwrap(), RefreshOutcome::Online);
        assert_eq!(backend.list_order_calls.load(Ordering::SeqCst), 1);

        // Once finished, the next refresh fetches again.
        core.refresh().await;
        assert_eq!(backend.list_order_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_refresh_after_role_switch_is_discarded() {
        let backend = seeded_backend();
        backend.set_orders(vec![order("bar-1", 1, Role::Bar, 1)]);
        let core = core_with(backend.clone());
        let gate = Arc::new(Notify::new());
        *backend.hold.lock().unwrap() = Some(gate.clone());

        let stale = tokio::spawn({
            let core = core.clone();
            async move { core.select_role(Role::Bar).await }
        });
        wait_until(|| backend.list_order_calls.load(Ordering::SeqCst) == 1).await;

        backend.set_orders(vec![order("w1-1", 4, Role::Waiter1, 2)]);
        assert_eq!(core.select_role(Role::Waiter1).await, RefreshOutcome::Online);

        gate.notify_one();
        assert_eq!(stale.await.unwrap(), RefreshOutcome::Superseded);

        assert_eq!(core.active_role(), Some(Role::Waiter1));
        let ids: Vec<String> = core.orders().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["w1-1".to_string()]);
        assert!(!core.is_busy());
    }

    // -----------------------------------------------------------------------
    // Event merge
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_delete_is_noop() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Bar).await;

        let delete = RemoteEvent::OrderDeleted {
            order_id: "o1".into(),
        };
        assert_eq!(core.apply_remote_event(delete.clone()).await, MergeOutcome::Removed);
        assert_eq!(core.apply_remote_event(delete).await, MergeOutcome::Ignored);
        assert!(core.order("o1").is_none());
        assert_eq!(core.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_update_for_unknown_order_inserts() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Bar).await;

        let outcome = core
            .apply_remote_event(RemoteEvent::OrderUpdated(order("o7", 7, Role::Waiter2, 9)))
            .await;
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(core.order("o7").unwrap().table_number, 7);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_idempotent() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Bar).await;

        let event = RemoteEvent::OrderCreated(order("o5", 5, Role::Bar, 10));
        assert_eq!(core.apply_remote_event(event.clone()).await, MergeOutcome::Inserted);
        assert_eq!(core.apply_remote_event(event).await, MergeOutcome::Replaced);
        assert_eq!(core.orders().len(), 3);
    }

    #[tokio::test]
    async fn test_catalog_events_merge() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Admin).await;

        let mut updated = product("p2", 4.0);
        updated.name = "Caña".into();
        core.apply_remote_event(RemoteEvent::ProductUpdated(updated))
            .await;
        assert_eq!(
            core.products().iter().find(|p| p.id == "p2").unwrap().price,
            4.0
        );

        core.apply_remote_event(RemoteEvent::CategoryCreated(category("c2", "bebida")))
            .await;
        assert_eq!(core.categories().len(), 2);
        assert_eq!(core.categories()[0].name, "bebida");

        assert_eq!(
            core.apply_remote_event(RemoteEvent::ProductDeleted {
                product_id: "nope".into()
            })
            .await,
            MergeOutcome::Ignored
        );
        assert_eq!(
            core.apply_remote_event(RemoteEvent::CategoryDeleted {
                category_id: "c1".into()
            })
            .await,
            MergeOutcome::Removed
        );
        assert_eq!(core.categories().len(), 1);
    }

    #[tokio::test]
    async fn test_merges_are_persisted() {
        let backend = seeded_backend();
        let cache = LocalCache::in_memory().unwrap();
        let core = SyncCore::new(backend, cache.clone(), None);
        core.select_role(Role::Bar).await;

        core.apply_remote_event(RemoteEvent::OrderCreated(order("o3", 3, Role::Bar, 20)))
            .await;
        let persisted = cache.load_snapshot().await;
        assert!(persisted.orders.iter().any(|o| o.id == "o3"));
    }

    #[tokio::test]
    async fn test_event_before_role_refresh_keeps_last_snapshot() {
        let backend = seeded_backend();
        let cache = LocalCache::in_memory().unwrap();
        let core = SyncCore::new(backend.clone(), cache.clone(), None);
        core.select_role(Role::Bar).await;
        let synced = cache.load_snapshot().await;
        assert_eq!(synced.orders.len(), 2);
        assert_eq!(synced.products.len(), 2);
        assert_eq!(synced.categories.len(), 1);

        // The new role's refresh is held open and will fail on products.
        let gate = Arc::new(Notify::new());
        *backend.hold.lock().unwrap() = Some(gate.clone());
        backend.fail_products.store(true, Ordering::SeqCst);
        let switch = tokio::spawn({
            let core = core.clone();
            async move { core.select_role(Role::Waiter1).await }
        });
        wait_until(|| backend.list_order_calls.load(Ordering::SeqCst) == 2).await;

        let outcome = core
            .apply_remote_event(RemoteEvent::OrderCreated(order("o9", 9, Role::Waiter1, 30)))
            .await;
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(cache.load_snapshot().await, synced);

        gate.notify_one();
        assert!(matches!(switch.await.unwrap(), RefreshOutcome::Offline { .. }));

        assert_eq!(cache.load_snapshot().await, synced);
        assert_eq!(core.orders().len(), 2);
        assert_eq!(core.products().len(), 2);
        assert_eq!(core.categories().len(), 1);
        assert!(core.order("o9").is_none());

        // Once a snapshot is loaded again, merges write through.
        core.apply_remote_event(RemoteEvent::OrderCreated(order("o10", 10, Role::Waiter1, 31)))
            .await;
        let persisted = cache.load_snapshot().await;
        assert_eq!(persisted.orders.len(), 3);
        assert_eq!(persisted.products.len(), 2);
    }

    #[tokio::test]
    async fn test_notifications_filtered_by_role() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Waiter1).await;
        let mut rx = core.subscribe();

        let other = Notification {
            role: Role::Bar,
            message: "Nuevo pedido".into(),
            order_id: None,
            timestamp: None,
        };
        assert_eq!(
            core.apply_remote_event(RemoteEvent::Notification(other)).await,
            MergeOutcome::Ignored
        );
        assert!(drain(&mut rx).is_empty());

        let mine = Notification {
            role: Role::Waiter1,
            message: "Mesa 2 lista".into(),
            order_id: Some("o2".into()),
            timestamp: None,
        };
        assert_eq!(
            core.apply_remote_event(RemoteEvent::Notification(mine.clone()))
                .await,
            MergeOutcome::Surfaced
        );
        assert_eq!(drain(&mut rx), vec![UiSignal::Notification(mine)]);
    }

    #[tokio::test]
    async fn test_order_ready_signal_for_own_orders_only() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Waiter1).await;
        let mut rx = core.subscribe();

        let ready = core.order("o2").unwrap().with_status(OrderStatus::Ready);
        core.apply_remote_event(RemoteEvent::OrderUpdated(ready.clone()))
            .await;
        let signals = drain(&mut rx);
        assert!(signals.contains(&UiSignal::OrderReady {
            order_id: "o2".into(),
            table_number: 2
        }));

        // Redelivery of the same state does not alert twice.
        core.apply_remote_event(RemoteEvent::OrderUpdated(ready)).await;
        assert!(!drain(&mut rx)
            .iter()
            .any(|s| matches!(s, UiSignal::OrderReady { .. })));

        // Bar's order becoming ready is not this role's concern.
        let bar_ready = core.order("o1").unwrap().with_status(OrderStatus::Ready);
        core.apply_remote_event(RemoteEvent::OrderUpdated(bar_ready))
            .await;
        assert!(!drain(&mut rx)
            .iter()
            .any(|s| matches!(s, UiSignal::OrderReady { .. })));
    }

    #[tokio::test]
    async fn test_daily_closure_event_triggers_refresh() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Admin).await;
        let before = backend.list_order_calls.load(Ordering::SeqCst);

        let outcome = core
            .apply_remote_event(RemoteEvent::DailyClosureCreated(json!({"total_sales": 10})))
            .await;
        assert_eq!(outcome, MergeOutcome::RefreshScheduled);
        wait_until(|| backend.list_order_calls.load(Ordering::SeqCst) > before).await;
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_waits_for_event_but_update_merges_immediately() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Waiter1).await;

        let created = core
            .create_order(NewOrder {
                table_number: 5,
                zone: Zone::InteriorLounge,
                lines: vec![OrderLine::from_product(&product("p1", 10.0), 2)],
                payment_method: Some(PaymentMethod::Cash),
                note: None,
                waiter_role: None,
            })
            .await
            .unwrap();
        assert_eq!(created.total, 20.0);
        assert_eq!(created.pending_amount, 20.0);
        assert_eq!(created.paid_amount, 0.0);
        assert_eq!(created.waiter_role, Role::Waiter1);
        assert!(core.order(&created.id).is_none());
        assert_eq!(core.orders().len(), 2);

        core.apply_remote_event(RemoteEvent::OrderCreated(created.clone()))
            .await;
        assert!(core.order(&created.id).is_some());

        let updated = core
            .update_order_status(&created.id, OrderStatus::InPreparation)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::InPreparation);
        assert_eq!(
            core.order(&created.id).unwrap().status,
            OrderStatus::InPreparation
        );
    }

    #[tokio::test]
    async fn test_delete_waits_for_event() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Bar).await;

        core.delete_order("o1").await.unwrap();
        assert!(core.order("o1").is_some());
        core.apply_remote_event(RemoteEvent::OrderDeleted {
            order_id: "o1".into(),
        })
        .await;
        assert!(core.order("o1").is_none());
    }

    #[tokio::test]
    async fn test_create_requires_role() {
        let core = core_with(seeded_backend());
        let err = core
            .create_order(NewOrder {
                table_number: 1,
                zone: Zone::Bar,
                lines: vec![],
                payment_method: None,
                note: None,
                waiter_role: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoActiveRole));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_unchanged() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;
        let before = core.snapshot();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let err = core
            .update_order_status("o1", OrderStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::MutationFailed {
                operation: "update order",
                ..
            }
        ));
        assert_eq!(core.order("o1").unwrap().status, OrderStatus::Pending);

        backend.offline.store(true, Ordering::SeqCst);
        let err = core.delete_product("p1").await.unwrap_err();
        assert!(matches!(err, SyncError::MutationFailed { .. }));

        let mut after = core.snapshot();
        let mut before = before;
        for snap in [&mut after, &mut before] {
            snap.orders.sort_by(|a, b| a.id.cmp(&b.id));
            snap.products.sort_by(|a, b| a.id.cmp(&b.id));
        }
        assert_eq!(after.orders, before.orders);
        assert_eq!(after.products, before.products);
    }

    #[tokio::test]
    async fn test_partial_payment_merges_response() {
        let backend = seeded_backend();
        backend.set_orders(vec![order("t5", 5, Role::Waiter1, 1)]);
        let core = core_with(backend.clone());
        core.select_role(Role::Waiter1).await;

        let paid = core
            .record_partial_payment(
                "t5",
                PartialPaymentRequest {
                    selection: PaymentSelection::Amount(8.0),
                    payment_method: PaymentMethod::Cash,
                    note: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.paid_amount, 8.0);
        assert_eq!(paid.pending_amount, 12.0);
        assert_eq!(paid.partial_payments.len(), 1);
        assert_eq!(paid.partial_payments[0].amount, 8.0);

        let canonical = core.order("t5").unwrap();
        assert_eq!(canonical.pending_amount, 12.0);
        assert!(canonical.is_balanced());

        let sent = backend.updated.lock().unwrap();
        assert_eq!(sent[0].1.paid_amount, 8.0);
        assert_eq!(sent[0].1.partial_payments.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_payment_rejected_locally() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;

        let err = core
            .record_partial_payment(
                "o1",
                PartialPaymentRequest {
                    selection: PaymentSelection::Amount(500.0),
                    payment_method: PaymentMethod::Card,
                    note: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayment(_)));
        assert!(backend.updated.lock().unwrap().is_empty());

        let err = core
            .record_partial_payment(
                "missing",
                PartialPaymentRequest {
                    selection: PaymentSelection::Amount(1.0),
                    payment_method: PaymentMethod::Card,
                    note: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn test_price_override_sends_recomputed_total() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;

        let edited = core.override_line_price("o1", "p1", 7.5).await.unwrap();
        assert_eq!(edited.total, 15.0);
        assert_eq!(edited.total, edited.lines_total());
        assert_eq!(edited.pending_amount, 15.0);
        assert_eq!(backend.updated.lock().unwrap()[0].1.total, 15.0);
    }

    #[tokio::test]
    async fn test_price_override_below_paid_is_rejected() {
        let backend = seeded_backend();
        backend.set_orders(vec![order("t5", 5, Role::Waiter1, 1)]);
        let core = core_with(backend.clone());
        core.select_role(Role::Waiter1).await;

        core.record_partial_payment(
            "t5",
            PartialPaymentRequest {
                selection: PaymentSelection::Amount(8.0),
                payment_method: PaymentMethod::Cash,
                note: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(backend.updated.lock().unwrap().len(), 1);

        let err = core.override_line_price("t5", "p1", 2.0).await.unwrap_err();
        assert!(matches!(err, SyncError::TotalBelowPaid { .. }));
        assert_eq!(backend.updated.lock().unwrap().len(), 1);

        let canonical = core.order("t5").unwrap();
        assert_eq!(canonical.total, 20.0);
        assert_eq!(canonical.paid_amount, 8.0);
        assert_eq!(canonical.pending_amount, 12.0);
        assert!(canonical.is_balanced());
    }

    #[tokio::test]
    async fn test_server_total_wins_on_update_response() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;

        let mut payload = core.order("o1").unwrap().to_payload();
        payload.total = 18.0; // server-side pricing decides
        let merged = core.update_order("o1", &payload).await.unwrap();
        assert_eq!(merged.total, 18.0);
        assert_eq!(merged.pending_amount, 18.0);
        assert!(merged.is_balanced());
    }

    #[tokio::test]
    async fn test_catalog_writes_wait_for_events() {
        let core = core_with(seeded_backend());
        core.select_role(Role::Admin).await;

        let created = core
            .create_product(&ProductPayload {
                name: "Flan".into(),
                category: "postre".into(),
                price: 4.5,
            })
            .await
            .unwrap();
        assert!(core.products().iter().all(|p| p.id != created.id));

        core.update_category(
            "c1",
            &CategoryPayload {
                name: "platos".into(),
                icon: "restaurant".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(core.categories()[0].name, "comida");
    }

    #[tokio::test]
    async fn test_close_day_builds_closure_from_stats() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Admin).await;

        let closure = core.close_day("administrador").await.unwrap();
        assert_eq!(closure.id.as_deref(), Some("dc1"));
        assert_eq!(closure.total_sales, 120.0);
        assert_eq!(closure.total_orders, 8);
        assert_eq!(closure.closed_by, "administrador");
        assert_eq!(core.daily_closures(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_model_filters() {
        let backend = seeded_backend();
        let mut no_zone = order("o3", 3, Role::Bar, 3);
        no_zone.zone = None;
        no_zone.status = OrderStatus::Ready;
        backend.set_orders(vec![
            order("o1", 1, Role::Bar, 1),
            order("o2", 2, Role::Waiter1, 5),
            no_zone,
        ]);
        let core = core_with(backend);
        core.select_role(Role::Bar).await;

        assert_eq!(core.orders_with_status(OrderStatus::Ready).len(), 1);
        assert_eq!(core.orders_in_zone(Zone::ExteriorTerrace).len(), 1);
        assert_eq!(core.orders_in_zone(Zone::InteriorLounge).len(), 2);
        assert_eq!(core.products_in_category("comida").len(), 2);
        assert!(core.products_in_category("bebida").is_empty());
    }

    // -----------------------------------------------------------------------
    // Live stream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconnect_schedules_catch_up_refresh() {
        let backend = seeded_backend();
        let core = core_with(backend.clone());
        core.select_role(Role::Bar).await;
        let before = backend.list_order_calls.load(Ordering::SeqCst);

        core.handle_stream_message(StreamMessage::Connected { reconnect: false })
            .await;
        assert!(core.is_live());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.list_order_calls.load(Ordering::SeqCst), before);

        core.handle_stream_message(StreamMessage::Disconnected).await;
        assert!(!core.is_live());

        backend.set_orders(vec![order("missed", 8, Role::Bar, 45)]);
        core.handle_stream_message(StreamMessage::Connected { reconnect: true })
            .await;
        assert!(core.is_live());
        wait_until(|| backend.list_order_calls.load(Ordering::SeqCst) > before).await;
        wait_until(|| core.order("missed").is_some()).await;
    }

    #[tokio::test]
    async fn test_stream_events_reach_canonical_state() {
        use futures::{SinkExt, StreamExt};
        use tokio::net::TcpListener;
        use tokio_tungstenite::{accept_async, tungstenite::Message};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let created = order("live-1", 12, Role::Bar, 50);
        let created_json = serde_json::to_string(&created).unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"0{"sid":"s","pingInterval":25000}"#.into()))
                .await
                .unwrap();
            let mut received = Vec::new();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                received.push(text.clone());
                if text == "40" {
                    ws.send(Message::Text("40".into())).await.unwrap();
                } else if text.starts_with("42[\"set_role\"") {
                    ws.send(Message::Text(format!("42[\"order_created\",{created_json}]")))
                        .await
                        .unwrap();
                } else if text == "41" {
                    break;
                }
            }
            received
        });

        let stream = StreamConfig {
            url: format!("ws://{addr}/socket.io/?EIO=4&transport=websocket"),
            reconnect_attempts: 0,
            reconnect_delay: Duration::from_millis(10),
        };
        let core = SyncCore::new(seeded_backend(), LocalCache::in_memory().unwrap(), Some(stream));
        core.select_role(Role::Bar).await;

        wait_until(|| core.order("live-1").is_some()).await;
        assert!(core.is_live());

        core.shutdown().await;
        assert!(!core.is_live());
        let received = server.await.unwrap();
        assert!(received.contains(&r#"42["set_role",{"role":"barra"}]"#.to_string()));
    }
}
