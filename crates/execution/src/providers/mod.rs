//! Provider adapters shipped with the execution core.

pub mod toxicology;

pub use toxicology::{ToxicologyBatch, BATCH_STEP, TOXICOLOGY_BATCH};
