//! Core module: per-instance extension state
//!
//! - Type-indexed: one slot per stored type, O(1) access after first use
//! - Owning: a hub owns what it stores and drops it on reset or replacement
//! - No inheritance: protocol state attaches to engines and sessions from outside

mod context_hub;

pub use context_hub::{assigned_type_count, ContextHub, HubError};
#[cfg(any(test, feature = "test-hooks"))]
pub use context_hub::reset_type_indices;
