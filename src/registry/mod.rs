pub mod grid;
pub mod job;

pub use grid::{Dequeued, GridJobState, GridTaskRecord, GridWorkerRecord};
pub use job::{AddJobResult, JobKind, JobRecord, JobRegistry, SimpleJobState, SimpleWorker};
