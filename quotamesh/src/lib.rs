//! # Quotamesh
//!
//! Fixed-window quota counters for API gateway throttling.
//!
//! ## Overview
//!
//! Quotamesh keeps one fixed-window counter per throttle key, in three
//! independent scopes (resource, application, subscription), and answers
//! "is this key currently throttled?" in constant time on the request hot
//! path:
//!
//! - **Fixed windows**: a counter resets at fixed-length boundaries aligned
//!   to the epoch, never a sliding or token-bucket scheme
//! - **Lazy rollover**: windows roll over on the next update or query, not
//!   on a timer
//! - **Per-key locking**: updates to the same key are linearized, updates to
//!   different keys never contend
//!
//! ## Quick Start
//!
//! ```
//! use quotamesh::{ThrottleScope, TimeUnit, WindowStore};
//!
//! let store = WindowStore::new();
//! let window = TimeUnit::Min.to_millis(1);
//!
//! // Ten requests per minute for this resource
//! for _ in 0..10 {
//!     store.update("resource:orders", ThrottleScope::Resource, 10, window, true, 1_000);
//! }
//!
//! assert!(store.is_throttled("resource:orders", ThrottleScope::Resource, 2_000));
//! // A new window clears the flag without any further update
//! assert!(!store.is_throttled("resource:orders", ThrottleScope::Resource, 70_000));
//! ```
//!
//! ## Window lengths
//!
//! Window lengths are derived from a policy unit and count via
//! [`TimeUnit::to_millis`]. Minute, hour and day are exact; week, month and
//! year are the 7/30/365-day approximations the upstream policy engine uses.
//!
//! The store owns no background tasks. Expired state is dropped lazily on
//! access and in bulk by [`WindowStore::sweep`], which the embedding process
//! drives on its own schedule.

pub mod store;
pub mod window;

pub use store::WindowStore;
pub use window::{ThrottleScope, TimeUnit, WindowSnapshot, WindowState};

use std::error::Error;
use std::fmt;

/// Errors surfaced by quota parameter handling
///
/// Configuration mistakes are loud by design: an unrecognized time unit must
/// never fall back to a default window length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// The policy's time unit string is not one of min/hour/day/week/month/year
    UnsupportedTimeUnit(String),
    /// A limit or window parameter was negative
    InvalidParameter(String),
}

impl fmt::Display for QuotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaError::UnsupportedTimeUnit(unit) => {
                write!(f, "unsupported time unit: {unit}")
            }
            QuotaError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}

impl Error for QuotaError {}
