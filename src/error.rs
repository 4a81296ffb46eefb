//! Error taxonomy for the order sync client.
//!
//! Nothing here is fatal to the process: the sync core recovers every
//! variant at its boundary and hands the caller a plain failure signal.
//! A read of a never-written cache key is not an error at all; it comes
//! back as an absent value or an empty collection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network unreachable, connection refused or request timed out.
    #[error("backend unreachable: {0}")]
    TransportUnavailable(String),

    /// The backend answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// A create/update/delete did not go through. Canonical state is
    /// left as it was.
    #[error("{operation} failed: {reason}")]
    MutationFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("offline cache: {0}")]
    Cache(String),

    #[error("no role selected")]
    NoActiveRole,

    #[error("order {0} is not loaded")]
    UnknownOrder(String),

    #[error("invalid partial payment: {0}")]
    InvalidPayment(String),

    #[error("invalid price: {0}")]
    InvalidPrice(f64),

    /// A price change would leave the order owing less than was already paid.
    #[error("new total {total:.2} is below the {paid:.2} already paid")]
    TotalBelowPaid { total: f64, paid: f64 },

    #[error("product {0} is not part of the order")]
    UnknownLine(String),
}

impl SyncError {
    /// Wrap a transport-level failure of a write into `MutationFailed`.
    pub fn into_mutation(self, operation: &'static str) -> SyncError {
        match self {
            SyncError::MutationFailed { .. } => self,
            other => SyncError::MutationFailed {
                operation,
                reason: other.to_string(),
            },
        }
    }

    /// True when the failure means the backend could not be reached at all.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Cache(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
