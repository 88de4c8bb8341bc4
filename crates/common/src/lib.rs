//! cellstore-common: shared types for the cellstore workspace.
//!
//! Provides the `ExtendedId` naming scheme used for data elements and
//! storage indexes, the content digest used to detect identifier reuse,
//! the caller-supplied identifier newtypes, and the protocol error taxonomy
//! that every sub-request result is expressed in.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of bytes in a content digest (SHA-1).
pub const DIGEST_BYTES: usize = 20;

// ---------------------------------------------------------------------------
// ExtendedId
// ---------------------------------------------------------------------------

/// A (GUID, integer) pair naming a data element or a storage index.
///
/// Equality is structural. Serialized as the string `"<guid>:<n>"` so it can
/// be used as a JSON map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ExtendedId {
    guid: Uuid,
    n: u32,
}

impl ExtendedId {
    /// The nil identifier, used as the version token of a never-written index.
    pub const NIL: Self = Self {
        guid: Uuid::nil(),
        n: 0,
    };

    pub fn new(guid: Uuid, n: u32) -> Self {
        Self { guid, n }
    }

    /// A fresh identifier with a random GUID.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4(), 1)
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Debug for ExtendedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.guid.simple().to_string();
        write!(f, "ExtendedId({}…:{})", &simple[..8], self.n)
    }
}

impl fmt::Display for ExtendedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.guid, self.n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed extended id: {0}")]
pub struct ParseExtendedIdError(String);

impl FromStr for ExtendedId {
    type Err = ParseExtendedIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (guid, n) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseExtendedIdError(s.to_string()))?;
        let guid = Uuid::parse_str(guid).map_err(|_| ParseExtendedIdError(s.to_string()))?;
        let n = n.parse().map_err(|_| ParseExtendedIdError(s.to_string()))?;
        Ok(Self { guid, n })
    }
}

impl From<ExtendedId> for String {
    fn from(id: ExtendedId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ExtendedId {
    type Error = ParseExtendedIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Logical key of a cell inside a storage index.
pub type CellKey = ExtendedId;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// SHA-1 digest of a data element's content, used to tell whether two
/// elements carrying the same identifier actually name the same bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest([u8; DIGEST_BYTES]);

impl ContentDigest {
    /// Digest over a sequence of byte slices, fed in order.
    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let mut bytes = [0u8; DIGEST_BYTES];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

// ---------------------------------------------------------------------------
// Caller-supplied identifiers
// ---------------------------------------------------------------------------

/// Identifies one client instance (an editor window) across requests.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

/// A client-chosen lock identifier (exclusive lock id or schema lock id).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub String);

/// The authenticated principal a batch runs as.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserName(pub String);

impl ClientId {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl LockId {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for UserName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Detail carried by [`ErrorKind::CellRequestFail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum CellErrorCode {
    #[error("coherency failure")]
    CoherencyFailure,
    #[error("referenced data element not found")]
    ReferencedDataElementNotFound,
    #[error("extended GUID collision")]
    ExtendedGuidCollision,
    #[error("aborted after failed put changes")]
    AbortedAfterFailedPutChanges,
    #[error("fragment invalid")]
    FragmentInvalid,
    #[error("partial put unknown or incomplete")]
    FragmentsIncomplete,
    #[error("request argument invalid")]
    RequestArgumentInvalid,
    #[error("storage failure")]
    StorageFailure,
}

/// Outcome of a failed sub-request. Every failure is local to the
/// sub-request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid argument")]
    InvalidArgument,

    // --- lock manager ---
    #[error("file already locked on server")]
    FileAlreadyLockedOnServer,
    #[error("file not locked on server")]
    FileNotLockedOnServer,
    #[error("file not locked on server as coauthoring is disabled")]
    FileNotLockedOnServerAsCoauthDisabled,
    #[error("file already checked out on server")]
    FileAlreadyCheckedOutOnServer,
    #[error("document checkout required")]
    DocumentCheckoutRequired,
    #[error("lock not converted as coauthoring is disabled")]
    LockNotConvertedAsCoauthDisabled,
    #[error("conversion to schema lock failed: file checked out by current user")]
    ConvertToSchemaFailedFileCheckedOutByCurrentUser,

    // --- coauthoring ---
    #[error("invalid coauthoring session")]
    InvalidCoauthSession,
    #[error("number of coauthors reached maximum")]
    NumberOfCoauthorsReachedMax,
    #[error("multiple clients in coauthoring session")]
    MultipleClientsInCoauthSession,
    #[error("exited coauthoring session as conversion to exclusive lock failed")]
    ExitCoauthSessionAsConvertToExclusiveFailed,

    // --- storage ---
    #[error("cell request failed: {0}")]
    CellRequestFail(CellErrorCode),
    #[error("file does not exist or cannot be created")]
    FileNotExistsOrCannotBeCreated,

    // --- dependency resolver ---
    #[error("dependent only on success, but the request failed")]
    DependentOnlyOnSuccessRequestFailed,
    #[error("dependent only on failure, but the request succeeded")]
    DependentOnlyOnFailRequestSucceeded,
    #[error("dependent only on not supported, but the request is supported")]
    DependentOnlyOnNotSupportedRequestGetSupported,
    #[error("dependent request not executed")]
    DependentRequestNotExecuted,
    #[error("invalid request dependency type")]
    InvalidRequestDependencyType,

    // --- misc ---
    #[error("request not supported")]
    RequestNotSupported,
    #[error("incompatible version")]
    IncompatibleVersion,
}

impl ErrorKind {
    pub fn cell(code: CellErrorCode) -> Self {
        Self::CellRequestFail(code)
    }

    /// Whether this error is a coherency failure of a cell request.
    pub fn is_coherency_failure(&self) -> bool {
        matches!(self, Self::CellRequestFail(CellErrorCode::CoherencyFailure))
    }
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
