//! Schema (shared) lock operations.
//!
//! All holders of a shared lock present the same schema lock id. When
//! co-authoring is disabled, or the caller has the file checked out, a
//! request that allows fallback is granted an exclusive lock named by the
//! schema lock id instead.

use crate::coauth::{CoauthJoin, CoauthStatus, TransitionId};
use crate::lock::{ExclusiveLock, FileLock, LockState, LockType, SharedLock, SharedMember};
use crate::policy::LockPolicy;
use cellstore_common::{ClientId, ErrorKind, LockId, UserName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why a shared-lock request was answered with an exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusiveLockReturnReason {
    CoauthoringDisabled,
    CheckedOutByCurrentUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLockRequest {
    pub client_id: ClientId,
    pub schema_lock_id: LockId,
    pub user: UserName,
    pub timeout_secs: Option<u64>,
    pub allow_fallback: bool,
}

impl SchemaLockRequest {
    pub fn new(
        client_id: impl Into<String>,
        schema_lock_id: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            client_id: ClientId(client_id.into()),
            schema_lock_id: LockId(schema_lock_id.into()),
            user: UserName(user.into()),
            timeout_secs: None,
            allow_fallback: false,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn allowing_fallback(mut self) -> Self {
        self.allow_fallback = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ErrorKind> {
        if self.client_id.is_empty() || self.schema_lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        Ok(())
    }
}

/// Lock state reported back for a successful lock sub-request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub lock_type: LockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_lock_return_reason: Option<ExclusiveLockReturnReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coauth_status: Option<CoauthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<TransitionId>,
}

impl LockGrant {
    /// Current state of `lock`, without transition details.
    pub fn current(lock: &FileLock) -> Self {
        Self {
            lock_type: lock.view().lock_type,
            exclusive_lock_return_reason: None,
            coauth_status: lock.session_status(),
            transition_id: None,
        }
    }

    /// Result of converting into a co-authoring session.
    pub fn joined(join: CoauthJoin) -> Self {
        Self {
            lock_type: LockType::Shared,
            exclusive_lock_return_reason: None,
            coauth_status: Some(join.status),
            transition_id: Some(join.transition_id),
        }
    }

    fn shared(lock: &SharedLock) -> Self {
        Self {
            lock_type: LockType::Shared,
            exclusive_lock_return_reason: None,
            coauth_status: Some(lock.status()),
            transition_id: Some(lock.transition),
        }
    }

    fn exclusive(reason: Option<ExclusiveLockReturnReason>) -> Self {
        Self {
            lock_type: LockType::Exclusive,
            exclusive_lock_return_reason: reason,
            coauth_status: None,
            transition_id: None,
        }
    }
}

impl FileLock {
    /// GetLock on a schema lock (also JoinCoauthoring).
    pub fn acquire_shared(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
    ) -> Result<LockGrant, ErrorKind> {
        req.validate()?;
        self.expire();
        self.guard_checkout(&req.user)?;

        if self.checkout.as_ref() == Some(&req.user) {
            if !req.allow_fallback {
                return Err(ErrorKind::ConvertToSchemaFailedFileCheckedOutByCurrentUser);
            }
            return self.fallback_exclusive(
                req,
                policy,
                ExclusiveLockReturnReason::CheckedOutByCurrentUser,
            );
        }
        if !policy.coauth_enabled {
            if !req.allow_fallback {
                return Err(ErrorKind::LockNotConvertedAsCoauthDisabled);
            }
            return self.fallback_exclusive(
                req,
                policy,
                ExclusiveLockReturnReason::CoauthoringDisabled,
            );
        }

        let deadline = Self::deadline(policy, req.timeout_secs);
        match &mut self.state {
            LockState::Exclusive(l) if l.is_fallback_for(&req.client_id, &req.schema_lock_id) => {
                l.expires = l.expires.max(deadline);
                Ok(LockGrant::exclusive(None))
            }
            LockState::Exclusive(_) if exclusive_conflicts => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(_) => Ok(()),
            LockState::Shared(s) if s.schema_id != req.schema_lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Shared(s) => {
                if let Some(m) = s.members.get_mut(&req.client_id) {
                    m.expires = m.expires.max(deadline);
                    return Ok(LockGrant::shared(s));
                }
                if !policy.admits_member(s.members.len()) {
                    return Err(ErrorKind::NumberOfCoauthorsReachedMax);
                }
                s.members.insert(
                    req.client_id.clone(),
                    SharedMember {
                        owner: req.user.clone(),
                        expires: deadline,
                    },
                );
                s.transition = TransitionId::new();
                tracing::debug!(
                    client = %req.client_id,
                    members = s.members.len(),
                    "client joined schema lock"
                );
                Ok(LockGrant::shared(s))
            }
            LockState::None => {
                let mut members = BTreeMap::new();
                members.insert(
                    req.client_id.clone(),
                    SharedMember {
                        owner: req.user.clone(),
                        expires: deadline,
                    },
                );
                let lock = SharedLock {
                    schema_id: req.schema_lock_id.clone(),
                    members,
                    transition: TransitionId::new(),
                };
                let grant = LockGrant::shared(&lock);
                self.state = LockState::Shared(lock);
                tracing::debug!(
                    client = %req.client_id,
                    schema_lock_id = %req.schema_lock_id,
                    "schema lock granted"
                );
                Ok(grant)
            }
        }
    }

    fn fallback_exclusive(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
        reason: ExclusiveLockReturnReason,
    ) -> Result<LockGrant, ErrorKind> {
        let deadline = Self::deadline(policy, req.timeout_secs);
        match &mut self.state {
            LockState::Exclusive(l) if l.is_fallback_for(&req.client_id, &req.schema_lock_id) => {
                l.expires = l.expires.max(deadline);
            }
            LockState::Exclusive(_) | LockState::Shared(_) => {
                return Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::None => {
                self.state = LockState::Exclusive(ExclusiveLock {
                    id: req.schema_lock_id.clone(),
                    owner: req.user.clone(),
                    expires: deadline,
                    fallback_client: Some(req.client_id.clone()),
                });
                tracing::debug!(client = %req.client_id, ?reason, "schema lock fell back to exclusive");
            }
        }
        Ok(LockGrant::exclusive(Some(reason)))
    }

    /// ReleaseLock on a schema lock. Releasing on an unlocked file, or on
    /// one held by someone else's exclusive lock, is a no-op.
    pub fn release_shared(&mut self, req: &SchemaLockRequest) -> Result<(), ErrorKind> {
        self.leave_shared(req, false)
    }

    /// Drop the caller's share. `exclusive_conflicts` makes a foreign
    /// exclusive lock an error instead of a no-op.
    pub(crate) fn leave_shared(
        &mut self,
        req: &SchemaLockRequest,
        exclusive_conflicts: bool,
    ) -> Result<(), ErrorKind> {
        req.validate()?;
        self.expire();
        self.guard_checkout(&req.user)?;
        match &mut self.state {
            LockState::None => Ok(()),
            LockState::Exclusive(l) if l.is_fallback_for(&req.client_id, &req.schema_lock_id) => {
                self.state = LockState::None;
                Ok(())
            }
            LockState::Exclusive(_) if exclusive_conflicts => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(_) => Ok(()),
            LockState::Shared(s) if s.schema_id != req.schema_lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Shared(s) => {
                if s.members.remove(&req.client_id).is_none() {
                    return Err(ErrorKind::InvalidCoauthSession);
                }
                if s.members.is_empty() {
                    self.state = LockState::None;
                }
                Ok(())
            }
        }
    }

    /// RefreshLock on a schema lock. A lapsed lock is taken again when
    /// co-authoring is enabled.
    pub fn refresh_shared(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
    ) -> Result<LockGrant, ErrorKind> {
        req.validate()?;
        self.expire();
        self.guard_checkout(&req.user)?;

        if matches!(self.state, LockState::None) {
            if !policy.coauth_enabled {
                return Err(ErrorKind::FileNotLockedOnServerAsCoauthDisabled);
            }
            return self.acquire_shared(req, policy);
        }

        let deadline = Self::deadline(policy, req.timeout_secs);
        match &mut self.state {
            LockState::None => Err(ErrorKind::FileNotLockedOnServer),
            LockState::Exclusive(l) if l.is_fallback_for(&req.client_id, &req.schema_lock_id) => {
                l.expires = l.expires.max(deadline);
                Ok(LockGrant::exclusive(None))
            }
            LockState::Exclusive(_) if exclusive_conflicts => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(_) => Ok(()),
            LockState::Shared(s) if s.schema_id != req.schema_lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Shared(s) => match s.members.get_mut(&req.client_id) {
                Some(m) => {
                    m.expires = m.expires.max(deadline);
                    Ok(LockGrant::shared(s))
                }
                None => Err(ErrorKind::InvalidCoauthSession),
            },
        }
    }

    /// ConvertToExclusive: the sole member of a schema lock takes an
    /// exclusive lock named `exclusive_lock_id`.
    pub fn convert_to_exclusive(
        &mut self,
        req: &SchemaLockRequest,
        exclusive_lock_id: &LockId,
        release_on_failure: bool,
        policy: &LockPolicy,
    ) -> Result<(), ErrorKind> {
        req.validate()?;
        if exclusive_lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        self.expire();
        self.guard_checkout(&req.user)?;
        self.guard_checkout_required(&req.user, policy)?;

        let deadline = Self::deadline(policy, req.timeout_secs);
        let LockState::Shared(s) = &mut self.state else {
            return Err(ErrorKind::InvalidCoauthSession);
        };
        if s.schema_id != req.schema_lock_id || !s.members.contains_key(&req.client_id) {
            return Err(ErrorKind::InvalidCoauthSession);
        }
        if s.members.len() > 1 {
            if release_on_failure {
                s.members.remove(&req.client_id);
                return Err(ErrorKind::ExitCoauthSessionAsConvertToExclusiveFailed);
            }
            return Err(ErrorKind::MultipleClientsInCoauthSession);
        }

        self.state = LockState::Exclusive(ExclusiveLock {
            id: exclusive_lock_id.clone(),
            owner: req.user.clone(),
            expires: deadline,
            fallback_client: None,
        });
        tracing::debug!(lock_id = %exclusive_lock_id, "schema lock converted to exclusive lock");
        Ok(())
    }

    /// CheckLockAvailability for a schema lock.
    pub fn check_shared_availability(
        &mut self,
        req: &SchemaLockRequest,
        policy: &LockPolicy,
    ) -> Result<(), ErrorKind> {
        req.validate()?;
        self.expire();
        self.guard_checkout(&req.user)?;
        match &self.state {
            LockState::Exclusive(l) if l.is_fallback_for(&req.client_id, &req.schema_lock_id) => {
                Ok(())
            }
            LockState::Exclusive(_) if exclusive_conflicts => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(_) => Ok(()),
            LockState::Shared(s) if s.schema_id != req.schema_lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Shared(s)
                if !s.members.contains_key(&req.client_id)
                    && !policy.admits_member(s.members.len()) =>
            {
                Err(ErrorKind::NumberOfCoauthorsReachedMax)
            }
            _ => Ok(()),
        }
    }
}
