//! Data-owning services built on the task scope, the deduplication layer and the caches.

mod records;

pub use records::RecordService;
