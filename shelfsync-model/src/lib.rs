//! Shared data model for the shelfsync upload pipeline: the durable
//! [`FileRecord`], its [`FsmState`] lifecycle, the write-ahead
//! [`UploadIntent`] log entry, and the [`ChangeSet`] produced by change
//! classification.
#![allow(missing_docs)]

pub mod change_set;
pub mod error;
pub mod hash;
pub mod ids;
pub mod record;
pub mod scan;

pub use change_set::ChangeSet;
pub use error::{ModelError, Result as ModelResult};
pub use ids::{AttemptId, RelPath};
pub use record::{ErrorClass, FileRecord, FsmState, OccToken, UploadIntent};
pub use scan::ScannedFile;
