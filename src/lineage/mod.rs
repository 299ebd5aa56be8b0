pub mod cert;
pub mod check;
pub mod entry;
pub mod recorder;
pub mod refs;

pub use cert::Certificate;
pub use check::{PreparedStep, StepDeclaration, make_step_lineage, prepare_step_lineage};
pub use entry::{CodeLineage, FiledLineage, ResourceLineage, SourceDataLineage, StepLineage};
pub use recorder::{RunningStep, StepRecorder, record_code, record_source_data};
pub use refs::ResourceRef;
