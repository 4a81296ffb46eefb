//! Laurel POS - order sync client
//!
//! Client-side core of the restaurant order system: keeps the order,
//! product and category collections of the selected staff role in sync with
//! the backend over REST and the live event stream, and falls back to an
//! offline SQLite cache when the backend cannot be reached.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod offline;
pub mod realtime;
pub mod sync;

pub use api::{ApiClient, Backend};
pub use config::Config;
pub use error::{Result, SyncError};
pub use events::RemoteEvent;
pub use models::{Order, OrderStatus, PaymentMethod, Role, Zone};
pub use offline::{LocalCache, Snapshot};
pub use realtime::StreamConfig;
pub use sync::{MergeOutcome, RefreshOutcome, SyncCore, UiSignal};

/// Run the headless client until Ctrl-C: select (or restore) a role, load
/// state, follow the live stream and log what a UI would be told.
pub async fn run(config: Config, role: Option<Role>) -> anyhow::Result<()> {
    info!("Starting laurel-pos v{}", env!("CARGO_PKG_VERSION"));
    info!(backend = %config.backend_url, data_dir = %config.data_dir.display(), "configuration loaded");

    let cache = LocalCache::open(&config.cache_path()).context("failed to open offline cache")?;
    let client = ApiClient::new(&config.backend_url, config.http_timeout())
        .context("failed to create REST client")?;
    debug!(api = client.base_url(), "REST client ready");
    let core = SyncCore::new(
        Arc::new(client),
        cache,
        Some(StreamConfig::from_config(&config)),
    );
    let mut signals = core.subscribe();

    let active = match role {
        Some(role) => {
            let outcome = core.select_role(role).await;
            debug!(?outcome, "initial refresh");
            Some(role)
        }
        None => core.restore_role().await,
    };
    let Some(active) = active else {
        warn!("No role selected; pass one of barra, camarero_1, camarero_2, administrador");
        return Ok(());
    };
    info!(role = %active, user = active.username(), "session started");
    log_summary(&core);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutting down");
                break;
            }
            signal = signals.recv() => match signal {
                Ok(UiSignal::StateChanged) => log_summary(&core),
                Ok(UiSignal::Notification(n)) => {
                    info!(order_id = ?n.order_id, "notification: {}", n.message);
                }
                Ok(UiSignal::OrderReady { order_id, table_number }) => {
                    info!(%order_id, table_number, "order ready for pickup");
                }
                Ok(UiSignal::ConnectivityChanged { online }) => {
                    if online {
                        info!("backend reachable again");
                    } else {
                        warn!("backend unreachable, showing cached data");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signal receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    core.shutdown().await;
    Ok(())
}

fn log_summary(core: &SyncCore) {
    let orders = core.orders();
    let open = orders
        .iter()
        .filter(|o| o.status != OrderStatus::Delivered)
        .count();
    debug!(
        orders = orders.len(),
        open,
        products = core.products().len(),
        categories = core.categories().len(),
        online = core.is_online(),
        live = core.is_live(),
        "state"
    );
}
