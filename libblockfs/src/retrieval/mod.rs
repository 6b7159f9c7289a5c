//! Block retrieval: a deduplicating priority queue and its fetch workers.
pub mod heap;
pub mod queue;

pub use heap::RetrievalHeap;
pub use queue::{BACKGROUND_PRIORITY, BlockRetrievalQueue, DEFAULT_MAX_PREFETCHES, ON_DEMAND_PRIORITY, RetrievalHandle};
