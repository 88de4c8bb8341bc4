//! Co-authoring sessions layered on the shared-lock member set.

use crate::lock::{FileLock, LockState};
use crate::policy::LockPolicy;
use crate::schema::{LockGrant, SchemaLockRequest};
use cellstore_common::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoauthStatus {
    Alone,
    Coauthoring,
}

impl CoauthStatus {
    pub fn for_members(count: usize) -> Self {
        if count > 1 {
            Self::Coauthoring
        } else {
            Self::Alone
        }
    }
}

/// Identifies one transition into or within a co-authoring session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(Uuid);

impl TransitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransitionId({})", self.0)
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoauthJoin {
    pub status: CoauthStatus,
    pub transition_id: TransitionId,
}

impl FileLock {
    /// JoinCoauthoring: take or share the schema lock.
    pub fn join_coauth(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
    ) -> Result<LockGrant, ErrorKind> {
        self.acquire_shared(req, policy)
    }

    /// ExitCoauthoring: leave the session; the last member out drops the lock.
    pub fn exit_coauth(&mut self, req: &SchemaLockRequest) -> Result<(), ErrorKind> {
        self.leave_shared(req, true)
    }

    /// RefreshCoauthoring.
    pub fn refresh_coauth(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
    ) -> Result<LockGrant, ErrorKind> {
        self.refresh_shared(req, policy)
    }

    /// MarkTransitionComplete: accepted from any current member.
    pub fn mark_transition_complete(&mut self, req: &SchemaLockRequest) -> Result<(), ErrorKind> {
        self.session_member(req).map(|_| ())
    }

    /// GetCoauthoringStatus for a current member.
    pub fn coauth_status(&mut self, req: &SchemaLockRequest) -> Result<CoauthStatus, ErrorKind> {
        self.session_member(req)
    }

    /// Status of the file's session, if a shared lock exists.
    pub fn session_status(&self) -> Option<CoauthStatus> {
        match &self.state {
            LockState::Shared(s) => Some(s.status()),
            _ => None,
        }
    }

    fn session_member(&mut self, req: &SchemaLockRequest) -> Result<CoauthStatus, ErrorKind> {
        req.validate()?;
        self.expire();
        self.guard_checkout(&req.user)?;
        match &self.state {
            LockState::Shared(s)
                if s.schema_id == req.schema_lock_id && s.members.contains_key(&req.client_id) =>
            {
                Ok(s.status())
            }
            _ => Err(ErrorKind::InvalidCoauthSession),
        }
    }
}
