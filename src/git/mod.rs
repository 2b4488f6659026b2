//! Git synchronization: batching, conflict resolution and claim arbitration

pub mod arbiter;
pub mod conflict;
pub mod coordinator;
pub mod queue;
pub mod repo;
pub mod runner;
pub mod status;

pub use conflict::{classify, ConflictEntry, ConflictKind, ConflictResolver, Outcome, ResolutionReport, Side, Strategy};
pub use coordinator::{
    CoordinatorStatus, GitBatchCoordinator, PullResult, PullStatus, PushResult, PushStatus, SyncResult,
};
pub use queue::{ManualResolutionQueue, QueuedConflict};
pub use repo::{Integration, Repo};
pub use runner::{GitCli, GitOutput, GitRunner};
pub use status::{is_stageable, BatchSummary, WorkingTreeStatus};
