//! Advisory locking
//!
//! [`FileLock`] is the primitive; [`LockManager`] hands out the named scopes
//! the store and coordinator use.

pub mod file_lock;
pub mod manager;

pub use file_lock::{is_process_alive, FileLock, LockGuard, LockHolder};
pub use manager::{LockManager, LockScope, LockSettings};
