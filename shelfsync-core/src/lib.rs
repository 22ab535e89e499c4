//! Upload pipeline and consistency machinery for the shelfsync
//! semantic-search indexer.
//!
//! A bounded-concurrency [`orchestrator::Orchestrator`] drives each file through the
//! [`fsm::Fsm`] lifecycle (UNTRACKED -> UPLOADING -> PROCESSING -> INDEXED,
//! with FAILED as an escape), backed by a durable [`catalog::Catalog`], a
//! [`rate_guard::RateGuard`] that paces and circuit-breaks calls to the
//! [`remote::RemoteClient`], and a [`reconciler::SyncReconciler`] that keeps
//! the on-disk library, the local catalog, and the remote store mutually
//! consistent across crashes.
//!
//! Semantic search, metadata extraction, UI rendering, and credential
//! storage are not this crate's concerns; see [`reconciler::FileScanner`]
//! and [`remote::RemoteClient`] for the trait seams external collaborators
//! implement.

pub mod catalog;
pub mod error;
pub mod fsm;
pub mod orchestrator;
pub mod rate_guard;
pub mod reconciler;
pub mod remote;

pub use catalog::{Catalog, CommitOutcome, TransitionSnapshot, TransitionUpdate};
pub use error::{CoreError, Result};
pub use fsm::{Fsm, StepOutcome};
pub use orchestrator::{BatchSummary, CancellationSignals, Orchestrator, OrchestratorConfig, RecordOutcome};
pub use rate_guard::{Outcome, RateGuard, RateGuardConfig, Ticket};
pub use reconciler::{FileScanner, ReconcileReport, SyncReconciler};
pub use remote::{split_doc_id, DocumentRef, DocumentStatus, HttpRemoteClient, OperationHandle, RemoteClient};
