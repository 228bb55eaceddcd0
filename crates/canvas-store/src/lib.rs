//! # canvas-store
//!
//! The Resource Store boundary: the [`ResourceStore`] trait authorization reads
//! through, the [`StoreChange`] notifications it subscribes to, and an
//! in-memory backend.

pub mod error;
pub mod events;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use events::{ChangeNotifier, StoreChange};
pub use memory::InMemoryResourceStore;
pub use traits::ResourceStore;

/// Type alias for a shareable store instance.
pub type DynResourceStore = std::sync::Arc<dyn ResourceStore>;
