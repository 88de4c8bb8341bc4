//! Lock manager for cellstore files.
//!
//! One [`FileLock`] per file holds the lock union (none, exclusive, shared
//! schema lock) together with the administrative checkout marker. Expiry is
//! lazy: every operation first drops leases that have run out, so a lock
//! refreshed before its deadline never lapses.
//!
//! Co-authoring sessions are derived from the member set of the shared lock
//! and carry no state of their own beyond the current transition id.

pub mod coauth;
pub mod lock;
pub mod policy;
pub mod schema;

pub use coauth::{CoauthJoin, CoauthStatus, TransitionId};
pub use lock::{
    ExclusiveLock, ExclusiveLockRequest, FileLock, LockState, LockType, LockView, SharedLock,
    SharedMember,
};
pub use policy::LockPolicy;
pub use schema::{ExclusiveLockReturnReason, LockGrant, SchemaLockRequest};
