//! Merge Engine: deduplication and aggregation of one connected component
//!
//! Raw records are grouped by entity name and by normalized endpoint pair.
//! Each group is folded onto the stored record under its lock set and
//! written through the Storage Writer before the locks are released.

mod aggregate;
mod engine;
mod summarizer;

pub use aggregate::{
    fold_entity, fold_relationship, join_fragments, split_fragments, split_keywords,
    stub_entity, validate_relationship, vote_entity_type, LEGACY_CONTRIBUTION,
};
pub use engine::{ComponentProgress, MergeEngine, MergeError, MergeResult, MergeSettings};
pub use summarizer::{CommandSummarizer, NoopSummarizer, SummarizeError, Summarizer};
#[cfg(test)]
pub(crate) use summarizer::mock::MockSummarizer;
