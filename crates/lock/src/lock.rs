//! Per-file lock state and the exclusive-lock operations.

use crate::coauth::{CoauthJoin, CoauthStatus, TransitionId};
use crate::policy::LockPolicy;
use cellstore_common::{ClientId, ErrorKind, LockId, UserName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    None,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveLock {
    pub id: LockId,
    pub owner: UserName,
    pub expires: Instant,
    /// Set when the lock was granted in place of a schema lock; the lock id
    /// is then the schema lock id and this is the requesting client.
    pub fallback_client: Option<ClientId>,
}

impl ExclusiveLock {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    /// Whether this is the fallback lock of `client` under `schema_lock_id`.
    pub fn is_fallback_for(&self, client: &ClientId, schema_lock_id: &LockId) -> bool {
        self.fallback_client.as_ref() == Some(client) && self.id == *schema_lock_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMember {
    pub owner: UserName,
    pub expires: Instant,
}

/// A schema lock and the clients sharing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLock {
    pub schema_id: LockId,
    pub members: BTreeMap<ClientId, SharedMember>,
    pub transition: TransitionId,
}

impl SharedLock {
    pub fn status(&self) -> CoauthStatus {
        CoauthStatus::for_members(self.members.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    None,
    Exclusive(ExclusiveLock),
    Shared(SharedLock),
}

/// Serializable summary of a file's lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    pub lock_type: LockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_lock_id: Option<LockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_lock_id: Option<LockId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_out_by: Option<UserName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveLockRequest {
    pub lock_id: LockId,
    pub user: UserName,
    pub timeout_secs: Option<u64>,
}

impl ExclusiveLockRequest {
    pub fn new(lock_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            lock_id: LockId(lock_id.into()),
            user: UserName(user.into()),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Lock state of one file plus its checkout marker.
#[derive(Debug, Clone, Default)]
pub struct FileLock {
    pub(crate) state: LockState,
    pub(crate) checkout: Option<UserName>,
}

impl FileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    pub fn checked_out_by(&self) -> Option<&UserName> {
        self.checkout.as_ref()
    }

    /// No lock and no checkout.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, LockState::None) && self.checkout.is_none()
    }

    pub fn view(&self) -> LockView {
        let mut view = LockView {
            lock_type: LockType::None,
            exclusive_lock_id: None,
            schema_lock_id: None,
            members: Vec::new(),
            checked_out_by: self.checkout.clone(),
        };
        match &self.state {
            LockState::None => {}
            LockState::Exclusive(l) => {
                view.lock_type = LockType::Exclusive;
                view.exclusive_lock_id = Some(l.id.clone());
            }
            LockState::Shared(s) => {
                view.lock_type = LockType::Shared;
                view.schema_lock_id = Some(s.schema_id.clone());
                view.members = s.members.keys().cloned().collect();
            }
        }
        view
    }

    /// Drop leases that have run out. Returns how many leases (an exclusive
    /// lock or shared members) expired.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        match &mut self.state {
            LockState::None => 0,
            LockState::Exclusive(l) => {
                if l.is_expired(now) {
                    tracing::debug!(lock_id = %l.id, "exclusive lock expired");
                    self.state = LockState::None;
                    1
                } else {
                    0
                }
            }
            LockState::Shared(s) => {
                let before = s.members.len();
                s.members.retain(|_, m| now < m.expires);
                let expired = before - s.members.len();
                if s.members.is_empty() {
                    tracing::debug!(schema_lock_id = %s.schema_id, "shared lock expired");
                    self.state = LockState::None;
                }
                expired
            }
        }
    }

    pub(crate) fn guard_checkout(&self, user: &UserName) -> Result<(), ErrorKind> {
        match &self.checkout {
            Some(owner) if owner != user => Err(ErrorKind::FileAlreadyCheckedOutOnServer),
            _ => Ok(()),
        }
    }

    pub(crate) fn guard_checkout_required(
        &self,
        user: &UserName,
        policy: &LockPolicy,
    ) -> Result<(), ErrorKind> {
        if policy.checkout_required && self.checkout.as_ref() != Some(user) {
            return Err(ErrorKind::DocumentCheckoutRequired);
        }
        Ok(())
    }

    pub(crate) fn deadline(policy: &LockPolicy, timeout_secs: Option<u64>) -> Instant {
        Instant::now() + policy.lease(timeout_secs)
    }

    // -----------------------------------------------------------------------
    // Exclusive lock
    // -----------------------------------------------------------------------

    /// GetLock. Re-acquiring with the same id refreshes the lease.
    pub fn acquire_exclusive(
        &mut self,
        req: &ExclusiveLockRequest,
        policy: &LockPolicy,
    ) -> Result<(), ErrorKind> {
        if req.lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        self.expire();
        self.guard_checkout(&req.user)?;
        self.guard_checkout_required(&req.user, policy)?;

        let deadline = Self::deadline(policy, req.timeout_secs);
        match &mut self.state {
            LockState::Shared(_) => Err(ErrorKind::FileAlreadyLockedOnServer),
            LockState::Exclusive(l) if l.id != req.lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(l) => {
                l.expires = l.expires.max(deadline);
                Ok(())
            }
            LockState::None => {
                self.state = LockState::Exclusive(ExclusiveLock {
                    id: req.lock_id.clone(),
                    owner: req.user.clone(),
                    expires: deadline,
                    fallback_client: None,
                });
                tracing::debug!(lock_id = %req.lock_id, user = %req.user, "exclusive lock granted");
                Ok(())
            }
        }
    }

    /// RefreshLock. Extends the lease; on an unlocked file it takes the lock.
    pub fn refresh_exclusive(
        &mut self,
        req: &ExclusiveLockRequest,
        policy: &LockPolicy,
    ) -> Result<(), ErrorKind> {
        self.acquire_exclusive(req, policy)
    }

    /// ReleaseLock.
    pub fn release_exclusive(&mut self, req: &ExclusiveLockRequest) -> Result<(), ErrorKind> {
        if req.lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        self.expire();
        self.guard_checkout(&req.user)?;
        match &self.state {
            LockState::None => Err(ErrorKind::FileNotLockedOnServer),
            LockState::Shared(_) => Err(ErrorKind::FileAlreadyLockedOnServer),
            LockState::Exclusive(l) if l.id != req.lock_id => Err(ErrorKind::FileNotLockedOnServer),
            LockState::Exclusive(_) => {
                self.state = LockState::None;
                Ok(())
            }
        }
    }

    /// CheckLockAvailability: would `acquire_exclusive` succeed.
    pub fn check_exclusive_availability(
        &mut self,
        req: &ExclusiveLockRequest,
    ) -> Result<(), ErrorKind> {
        if req.lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        self.expire();
        self.guard_checkout(&req.user)?;
        match &self.state {
            LockState::Shared(_) => Err(ErrorKind::FileAlreadyLockedOnServer),
            LockState::Exclusive(l) if l.id != req.lock_id => {
                Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            _ => Ok(()),
        }
    }

    /// ConvertToSchema / ConvertToSchemaJoinCoauth: turn the caller's
    /// exclusive lock into a schema lock with the caller as sole member.
    pub fn convert_to_schema(
        &mut self,
        req: &ExclusiveLockRequest,
        client: &ClientId,
        schema_lock_id: &LockId,
        policy: &LockPolicy,
    ) -> Result<CoauthJoin, ErrorKind> {
        if req.lock_id.is_empty() || client.is_empty() || schema_lock_id.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        self.expire();
        self.guard_checkout(&req.user)?;
        self.guard_checkout_required(&req.user, policy)?;

        let owner = match &self.state {
            LockState::None => return Err(ErrorKind::FileNotLockedOnServer),
            LockState::Shared(_) => return Err(ErrorKind::FileAlreadyLockedOnServer),
            LockState::Exclusive(l) if l.id != req.lock_id => {
                return Err(ErrorKind::FileAlreadyLockedOnServer)
            }
            LockState::Exclusive(l) => l.owner.clone(),
        };
        if !policy.coauth_enabled {
            return Err(ErrorKind::LockNotConvertedAsCoauthDisabled);
        }
        if self.checkout.as_ref() == Some(&req.user) {
            return Err(ErrorKind::ConvertToSchemaFailedFileCheckedOutByCurrentUser);
        }

        let transition = TransitionId::new();
        let mut members = BTreeMap::new();
        members.insert(
            client.clone(),
            SharedMember {
                owner,
                expires: Self::deadline(policy, req.timeout_secs),
            },
        );
        self.state = LockState::Shared(SharedLock {
            schema_id: schema_lock_id.clone(),
            members,
            transition,
        });
        tracing::debug!(
            lock_id = %req.lock_id,
            schema_lock_id = %schema_lock_id,
            "exclusive lock converted to schema lock"
        );
        Ok(CoauthJoin {
            status: CoauthStatus::Alone,
            transition_id: transition,
        })
    }

    // -----------------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------------

    /// Mark the file checked out by `user`. Locks held by other users
    /// block the checkout; the user's own locks survive it.
    pub fn check_out(&mut self, user: &UserName) -> Result<(), ErrorKind> {
        self.guard_checkout(user)?;
        self.expire();
        let foreign = match &self.state {
            LockState::None => false,
            LockState::Exclusive(l) => l.owner != *user,
            LockState::Shared(s) => s.members.values().any(|m| m.owner != *user),
        };
        if foreign {
            return Err(ErrorKind::FileAlreadyLockedOnServer);
        }
        self.checkout = Some(user.clone());
        Ok(())
    }

    /// Clear the checkout marker. Only the holder may check in.
    pub fn check_in(&mut self, user: &UserName) -> Result<(), ErrorKind> {
        self.guard_checkout(user)?;
        self.checkout = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cell writes
    // -----------------------------------------------------------------------

    /// Whether a content write by `user` carrying these lock references is
    /// compatible with the current lock.
    pub fn permits_write(
        &mut self,
        user: &UserName,
        schema_lock_id: Option<&LockId>,
        exclusive_lock_id: Option<&LockId>,
    ) -> Result<(), ErrorKind> {
        self.expire();
        self.guard_checkout(user)?;
        match &self.state {
            LockState::None => Ok(()),
            LockState::Exclusive(l) => {
                if exclusive_lock_id == Some(&l.id)
                    || (l.fallback_client.is_some() && schema_lock_id == Some(&l.id))
                {
                    Ok(())
                } else {
                    Err(ErrorKind::FileAlreadyLockedOnServer)
                }
            }
            LockState::Shared(s) => {
                if schema_lock_id == Some(&s.schema_id) {
                    Ok(())
                } else {
                    Err(ErrorKind::FileAlreadyLockedOnServer)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn req(id: &str) -> ExclusiveLockRequest {
        ExclusiveLockRequest::new(id, "alice")
    }

    fn coauth_disabled() -> LockPolicy {
        LockPolicy {
            coauth_enabled: false,
            ..LockPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let policy = LockPolicy::default();
        let mut lock = FileLock::new();
        lock.acquire_exclusive(&req("a"), &policy).unwrap();
        assert_eq!(lock.view().lock_type, LockType::Exclusive);

        // same id refreshes, different id conflicts
        lock.acquire_exclusive(&req("a"), &policy).unwrap();
        assert_eq!(
            lock.acquire_exclusive(&req("b"), &policy),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
        assert_eq!(
            lock.check_exclusive_availability(&req("b")),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
        assert_eq!(lock.check_exclusive_availability(&req("a")), Ok(()));

        assert_eq!(
            lock.release_exclusive(&req("b")),
            Err(ErrorKind::FileNotLockedOnServer)
        );
        lock.release_exclusive(&req("a")).unwrap();
        assert!(lock.is_idle());
        assert_eq!(
            lock.release_exclusive(&req("a")),
            Err(ErrorKind::FileNotLockedOnServer)
        );
    }

    #[tokio::test]
    async fn test_missing_lock_id_is_invalid_argument() {
        let policy = LockPolicy::default();
        let mut lock = FileLock::new();
        lock.acquire_exclusive(&req("a"), &policy).unwrap();
        // argument check precedes state inspection
        assert_eq!(
            lock.acquire_exclusive(&req(""), &policy),
            Err(ErrorKind::InvalidArgument)
        );
        assert_eq!(lock.release_exclusive(&req(" ")), Err(ErrorKind::InvalidArgument));
        assert_eq!(
            lock.check_exclusive_availability(&req("")),
            Err(ErrorKind::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn test_refresh_on_unlocked_file_takes_lock() {
        let policy = LockPolicy::default();
        let mut lock = FileLock::new();
        lock.refresh_exclusive(&req("a"), &policy).unwrap();
        assert_eq!(
            lock.check_exclusive_availability(&req("b")),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        tokio::time::pause();
        let policy = LockPolicy::default();
        let mut lock = FileLock::new();
        lock.acquire_exclusive(&req("a").with_timeout(60), &policy)
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            lock.acquire_exclusive(&req("b"), &policy),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        lock.acquire_exclusive(&req("b"), &policy).unwrap();
    }

    #[tokio::test]
    async fn test_refresh_never_shortens_lease() {
        tokio::time::pause();
        let policy = LockPolicy::default();
        let mut lock = FileLock::new();
        lock.acquire_exclusive(&req("a").with_timeout(600), &policy)
            .unwrap();
        lock.refresh_exclusive(&req("a").with_timeout(10), &policy)
            .unwrap();

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(lock.expire(), 0);
        assert_eq!(
            lock.acquire_exclusive(&req("b"), &policy),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
    }

    #[tokio::test]
    async fn test_checkout_rules() {
        let policy = LockPolicy {
            checkout_required: true,
            ..LockPolicy::default()
        };
        let mut lock = FileLock::new();
        assert_eq!(
            lock.acquire_exclusive(&req("a"), &policy),
            Err(ErrorKind::DocumentCheckoutRequired)
        );

        lock.check_out(&UserName::from("bob")).unwrap();
        assert_eq!(
            lock.acquire_exclusive(&req("a"), &policy),
            Err(ErrorKind::FileAlreadyCheckedOutOnServer)
        );
        assert_eq!(
            lock.check_out(&UserName::from("alice")),
            Err(ErrorKind::FileAlreadyCheckedOutOnServer)
        );

        lock.check_in(&UserName::from("bob")).unwrap();
        lock.check_out(&UserName::from("alice")).unwrap();
        lock.acquire_exclusive(&req("a"), &policy).unwrap();

        // alice's own lock survives her checkout; bob's lock blocks his checkout of it
        lock.check_in(&UserName::from("alice")).unwrap();
        lock.check_out(&UserName::from("alice")).unwrap();
        lock.check_in(&UserName::from("alice")).unwrap();
        assert_eq!(
            lock.check_out(&UserName::from("bob")),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
    }

    #[tokio::test]
    async fn test_convert_to_schema() {
        let policy = LockPolicy::default();
        let client = ClientId::from("c1");
        let schema = LockId::from("s1");
        let mut lock = FileLock::new();

        assert_eq!(
            lock.convert_to_schema(&req("a"), &client, &schema, &policy),
            Err(ErrorKind::FileNotLockedOnServer)
        );
        lock.acquire_exclusive(&req("a"), &policy).unwrap();
        assert_eq!(
            lock.convert_to_schema(&req("b"), &client, &schema, &policy),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
        assert_eq!(
            lock.convert_to_schema(&req("a"), &client, &LockId::from(""), &policy),
            Err(ErrorKind::InvalidArgument)
        );

        let join = lock
            .convert_to_schema(&req("a"), &client, &schema, &policy)
            .unwrap();
        assert_eq!(join.status, CoauthStatus::Alone);
        let view = lock.view();
        assert_eq!(view.lock_type, LockType::Shared);
        assert_eq!(view.schema_lock_id, Some(schema));
        assert_eq!(view.members, vec![client]);

        // an exclusive release no longer applies
        assert_eq!(
            lock.release_exclusive(&req("a")),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
    }

    #[tokio::test]
    async fn test_convert_to_schema_coauth_disabled() {
        let mut lock = FileLock::new();
        lock.acquire_exclusive(&req("a"), &coauth_disabled()).unwrap();
        assert_eq!(
            lock.convert_to_schema(
                &req("a"),
                &ClientId::from("c1"),
                &LockId::from("s1"),
                &coauth_disabled()
            ),
            Err(ErrorKind::LockNotConvertedAsCoauthDisabled)
        );
        assert_eq!(lock.view().lock_type, LockType::Exclusive);
    }

    #[tokio::test]
    async fn test_transition_ids_unique() {
        let policy = LockPolicy::default();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let mut lock = FileLock::new();
            lock.acquire_exclusive(&req("a"), &policy).unwrap();
            let join = lock
                .convert_to_schema(&req("a"), &ClientId::from("c"), &LockId::from("s"), &policy)
                .unwrap();
            assert!(ids.insert(join.transition_id));
        }
    }

    #[tokio::test]
    async fn test_permits_write() {
        let policy = LockPolicy::default();
        let alice = UserName::from("alice");
        let a = LockId::from("a");
        let mut lock = FileLock::new();
        assert_eq!(lock.permits_write(&alice, None, None), Ok(()));

        lock.acquire_exclusive(&req("a"), &policy).unwrap();
        assert_eq!(lock.permits_write(&alice, None, Some(&a)), Ok(()));
        assert_eq!(
            lock.permits_write(&alice, None, None),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
        assert_eq!(
            lock.permits_write(&alice, Some(&a), None),
            Err(ErrorKind::FileAlreadyLockedOnServer)
        );
    }
}
