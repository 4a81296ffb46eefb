//! REST client for the restaurant backend.
//!
//! Stateless request functions per resource. Every call returns the parsed
//! body on 2xx and an error otherwise; there is no retry here. Whoever calls
//! decides what a failure means (the sync core falls back to the offline
//! cache on reads and surfaces writes as `MutationFailed`).

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::{
    Category, CategoryPayload, DailyClosure, DailyStats, Order, OrderPayload, PartialPayment,
    Product, ProductPayload, Settings, WeeklyStats,
};

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::TransportUnavailable(format!("cannot reach backend at {url}"));
    }
    if err.is_timeout() {
        return SyncError::TransportUnavailable(format!("connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::TransportUnavailable(format!("invalid backend URL: {url}"));
    }
    if err.is_decode() {
        return SyncError::Decode(err.to_string());
    }
    SyncError::TransportUnavailable(format!("network error communicating with {url}: {err}"))
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        404 => "Resource not found".to_string(),
        422 => "Request rejected by backend validation".to_string(),
        s if s >= 500 => "Backend server error".to_string(),
        _ => "Unexpected response from backend".to_string(),
    }
}

/// Build the error for a non-2xx answer, keeping FastAPI's `detail` when
/// the body carries one.
fn http_error(status: StatusCode, body_text: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("detail")
                .or_else(|| json.get("message"))
                .or_else(|| json.get("error"))
                .map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| status_error(status));
    SyncError::Http {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Operations the sync core needs from the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_orders(&self) -> Result<Vec<Order>>;
    async fn create_order(&self, order: &OrderPayload) -> Result<Order>;
    async fn update_order(&self, id: &str, order: &OrderPayload) -> Result<Order>;
    async fn delete_order(&self, id: &str) -> Result<Value>;
    async fn add_partial_payment(&self, id: &str, payment: &PartialPayment) -> Result<Order>;

    async fn list_products(&self) -> Result<Vec<Product>>;
    async fn create_product(&self, product: &ProductPayload) -> Result<Product>;
    async fn update_product(&self, id: &str, product: &ProductPayload) -> Result<Product>;
    async fn delete_product(&self, id: &str) -> Result<Value>;

    async fn list_categories(&self) -> Result<Vec<Category>>;
    async fn create_category(&self, category: &CategoryPayload) -> Result<Category>;
    async fn update_category(&self, id: &str, category: &CategoryPayload) -> Result<Category>;
    async fn delete_category(&self, id: &str) -> Result<Value>;

    async fn daily_stats(&self, date: Option<NaiveDate>) -> Result<DailyStats>;
    async fn weekly_stats(&self) -> Result<WeeklyStats>;
    async fn daily_closures(&self, limit: u32) -> Result<Vec<DailyClosure>>;
    async fn create_daily_closure(&self, closure: &DailyClosure) -> Result<DailyClosure>;

    async fn settings(&self) -> Result<Settings>;
    async fn update_settings(&self, settings: &Settings) -> Result<Settings>;
    async fn seed(&self) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    /// e.g. `http://localhost:8001/api`
    base: String,
}

impl ApiClient {
    pub fn new(backend_url: &str, timeout: Duration) -> Result<Self> {
        let origin = normalize_backend_url(backend_url);
        if origin.is_empty() {
            return Err(SyncError::TransportUnavailable(
                "backend URL is not configured".into(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::TransportUnavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: format!("{origin}/api"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Perform one request. `path` includes the leading slash, e.g. `/orders`.
    async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.base);
        let mut req = self.client.request(method.clone(), &url);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| {
            let err = transport_error(&self.base, &e);
            warn!(%method, path, error = %err, "backend request failed");
            err
        })?;
        let status = resp.status();
        let body_text = resp.text().await.map_err(|e| transport_error(&self.base, &e))?;

        if !status.is_success() {
            let err = http_error(status, &body_text);
            warn!(%method, path, status = status.as_u16(), error = %err, "backend rejected request");
            return Err(err);
        }

        debug!(%method, path, status = status.as_u16(), bytes = body_text.len(), "backend request ok");
        let text = if body_text.trim().is_empty() {
            "null"
        } else {
            body_text.as_str()
        };
        serde_json::from_str(text).map_err(|e| SyncError::Decode(format!("{path}: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.request::<Value, ()>(Method::DELETE, path, None).await
    }
}

fn encode_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait]
impl Backend for ApiClient {
    async fn list_orders(&self) -> Result<Vec<Order>> {
        self.get("/orders").await
    }

    async fn create_order(&self, order: &OrderPayload) -> Result<Order> {
        self.request(Method::POST, "/orders", Some(order)).await
    }

    async fn update_order(&self, id: &str, order: &OrderPayload) -> Result<Order> {
        let path = format!("/orders/{}", encode_segment(id));
        self.request(Method::PUT, &path, Some(order)).await
    }

    async fn delete_order(&self, id: &str) -> Result<Value> {
        self.delete(&format!("/orders/{}", encode_segment(id))).await
    }

    async fn add_partial_payment(&self, id: &str, payment: &PartialPayment) -> Result<Order> {
        let path = format!("/orders/{}/partial-payment", encode_segment(id));
        self.request(Method::POST, &path, Some(payment)).await
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        self.get("/products").await
    }

    async fn create_product(&self, product: &ProductPayload) -> Result<Product> {
        self.request(Method::POST, "/products", Some(product)).await
    }

    async fn update_product(&self, id: &str, product: &ProductPayload) -> Result<Product> {
        let path = format!("/products/{}", encode_segment(id));
        self.request(Method::PUT, &path, Some(product)).await
    }

    async fn delete_product(&self, id: &str) -> Result<Value> {
        self.delete(&format!("/products/{}", encode_segment(id))).await
    }

    async fn list_categories(&self) -> Result<Vec<Category>> {
        self.get("/categories").await
    }

    async fn create_category(&self, category: &CategoryPayload) -> Result<Category> {
        self.request(Method::POST, "/categories", Some(category)).await
    }

    async fn update_category(&self, id: &str, category: &CategoryPayload) -> Result<Category> {
        let path = format!("/categories/{}", encode_segment(id));
        self.request(Method::PUT, &path, Some(category)).await
    }

    async fn delete_category(&self, id: &str) -> Result<Value> {
        self.delete(&format!("/categories/{}", encode_segment(id))).await
    }

    async fn daily_stats(&self, date: Option<NaiveDate>) -> Result<DailyStats> {
        match date {
            Some(d) => self.get(&format!("/daily-stats?date={}", d.format("%Y-%m-%d"))).await,
            None => self.get("/daily-stats").await,
        }
    }

    async fn weekly_stats(&self) -> Result<WeeklyStats> {
        self.get("/weekly-stats").await
    }

    async fn daily_closures(&self, limit: u32) -> Result<Vec<DailyClosure>> {
        self.get(&format!("/daily-closures?limit={limit}")).await
    }

    async fn create_daily_closure(&self, closure: &DailyClosure) -> Result<DailyClosure> {
        self.request(Method::POST, "/daily-closures", Some(closure)).await
    }

    async fn settings(&self) -> Result<Settings> {
        self.get("/settings").await
    }

    async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        self.request(Method::PUT, "/settings", Some(settings)).await
    }

    async fn seed(&self) -> Result<Value> {
        self.request::<Value, ()>(Method::POST, "/seed", None).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
