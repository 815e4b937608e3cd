//! Core graph data model

mod record;
mod workspace;

pub use record::{
    EdgeKey, MergedEntity, MergedRelationship, RawBatch, RawEntity, RawRelationship,
    GRAPH_FIELD_SEP, UNKNOWN_ENTITY_TYPE,
};
pub use workspace::{GraphError, Workspace};
