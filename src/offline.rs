//! Offline cache of the last known server state.
//!
//! Four documents are kept: the selected role and the three canonical
//! collections. A snapshot is only ever read as a whole fallback when the
//! backend cannot be reached; it is never merged with fresh data. Reads never
//! fail: a miss or an unreadable document yields an empty value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::db::{self, DbState};
use crate::error::{Result, SyncError};
use crate::models::{Category, Order, Product, Role};

pub const KEY_ROLE: &str = "user_role";
pub const KEY_ORDERS: &str = "offline_orders";
pub const KEY_PRODUCTS: &str = "offline_products";
pub const KEY_CATEGORIES: &str = "offline_categories";

/// The three canonical collections as last persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub orders: Vec<Order>,
    pub products: Vec<Product>,
    pub categories: Vec<Category>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.products.is_empty() && self.categories.is_empty()
    }
}

#[derive(Clone)]
pub struct LocalCache {
    db: DbState,
}

impl LocalCache {
    pub fn new(db: DbState) -> Self {
        Self { db }
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        Ok(Self::new(db::init(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(db::open_in_memory()?))
    }

    // -----------------------------------------------------------------------
    // Role
    // -----------------------------------------------------------------------

    pub async fn load_role(&self) -> Option<Role> {
        self.read_doc::<Role>(KEY_ROLE).await
    }

    pub async fn save_role(&self, role: Role) -> Result<()> {
        self.write_doc(KEY_ROLE, &role).await
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    pub async fn load_snapshot(&self) -> Snapshot {
        Snapshot {
            orders: self.read_doc(KEY_ORDERS).await.unwrap_or_default(),
            products: self.read_doc(KEY_PRODUCTS).await.unwrap_or_default(),
            categories: self.read_doc(KEY_CATEGORIES).await.unwrap_or_default(),
        }
    }

    /// Replace all three collections in one transaction.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let orders = encode(KEY_ORDERS, &snapshot.orders)?;
        let products = encode(KEY_PRODUCTS, &snapshot.products)?;
        let categories = encode(KEY_CATEGORIES, &snapshot.categories)?;
        let db = self.db.clone();

        run_blocking(move || {
            let mut conn = lock(&db)?;
            let tx = conn.transaction()?;
            db::set_value(&tx, KEY_ORDERS, &orders)?;
            db::set_value(&tx, KEY_PRODUCTS, &products)?;
            db::set_value(&tx, KEY_CATEGORIES, &categories)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(
            orders = snapshot.orders.len(),
            products = snapshot.products.len(),
            categories = snapshot.categories.len(),
            "offline snapshot saved"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn read_doc<T>(&self, key: &'static str) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let db = self.db.clone();
        let raw = run_blocking(move || {
            let conn = lock(&db)?;
            db::get_value(&conn, key)
        })
        .await;

        match raw {
            Ok(Some(s)) => match serde_json::from_str::<T>(&s) {
                Ok(v) => Some(v),
                Err(e) => {
                    error!("offline_cache[{key}] JSON parse error: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("offline_cache[{key}] read failed: {e}");
                None
            }
        }
    }

    async fn write_doc<T: Serialize>(&self, key: &'static str, value: &T) -> Result<()> {
        let json = encode(key, value)?;
        let db = self.db.clone();
        run_blocking(move || {
            let conn = lock(&db)?;
            db::set_value(&conn, key, &json)
        })
        .await
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SyncError::Cache(format!("encode {key}: {e}")))
}

fn lock(db: &DbState) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
    db.conn
        .lock()
        .map_err(|e| SyncError::Cache(format!("cache lock poisoned: {e}")))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Cache(format!("cache task failed: {e}")))?
}

// ===========================================================================
// Tests
// ===========================================================================
