pub mod config;
pub mod error;
pub mod lineage;
pub mod query;
pub mod store;

pub use error::{LineageError, LineageResult};
pub use lineage::{Certificate, ResourceLineage, ResourceRef, StepLineage};
pub use store::{FileLineageStore, LineageStore, LineageView};
