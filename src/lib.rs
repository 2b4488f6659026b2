//! Hypernet Store - file-backed graph store synchronized through git
//!
//! Many independent writers (people, AI agents, machines) edit one shared
//! graph. Each entity and link is its own JSON file, so git can merge
//! unrelated edits; everything that would otherwise collide is either derived
//! (indexes, rebuilt after every pull), owned by one contributor (address
//! reservations, task claims), or resolved by a deterministic rule.
//!
//! ## Layers
//!
//! | Layer | Module | Blocking? |
//! |-------|--------|-----------|
//! | Addresses | [`address`] | - |
//! | Advisory locks | [`locks`] | yes |
//! | Entity/link store, history, indexes | [`store`], [`rebuild`] | yes |
//! | Address ranges, task claims | [`allocator`], [`claims`] | yes |
//! | Pull/push/sync, conflict resolution | [`git`] | async (tokio) |
//!
//! ## Example
//!
//! ```no_run
//! use hypernet_store::{Address, LockSettings, Node, Store};
//!
//! # fn main() -> Result<(), hypernet_store::StoreError> {
//! let store = Store::open("data", LockSettings::default())?;
//! let address = Address::parse("1.1.1")?;
//! store.put(&Node::new(address.clone()).with_type(Address::parse("0.5.1")?))?;
//! assert!(store.get(&address)?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod allocator;
pub mod claims;
pub mod config;
pub mod contributor;
pub mod error;
pub mod git;
pub mod link;
pub mod locks;
pub mod node;
pub mod rebuild;
pub mod store;

// Re-exports
pub use address::Address;
pub use allocator::{AddressAllocator, AddressCollision, AddressReservation};
pub use claims::{Authority, ClaimConflict, ClaimStatus, TaskClaim, TaskClaimer};
pub use config::Config;
pub use contributor::ContributorId;
pub use error::{AddressError, ConfigError, GitError, LockError, StoreError};
pub use git::{GitBatchCoordinator, GitCli, GitRunner, PullStatus, PushStatus, SyncResult};
pub use link::{Link, LinkStatus};
pub use locks::{LockManager, LockScope, LockSettings};
pub use node::Node;
pub use rebuild::{IndexRebuilder, RebuildStats, ValidationIssue};
pub use store::{NodeFilter, Store, StoreStats};
