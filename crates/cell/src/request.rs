//! Batch request and response model.
//!
//! This is the JSON shape carried by the transport. Lock identifiers are
//! plain strings here so that a missing identifier can be reported as
//! `InvalidArgument` by the lock manager instead of failing to parse.

use crate::dependency::DependencyKind;
use cellstore_common::{CellKey, ErrorKind, ExtendedId, UserName};
use cellstore_lock::LockGrant;
use cellstore_storage::{DataElement, DataElementKind, Fragment, StorageIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self { major: 2, minor: 3 };

    pub fn is_supported(&self) -> bool {
        self.major == 2 && self.minor <= 3
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub url: String,
    pub user: UserName,
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sub_requests: Vec<SubRequest>,
}

impl BatchRequest {
    pub fn new(url: impl Into<String>, user: &str, sub_requests: Vec<SubRequest>) -> Self {
        Self {
            url: url.into(),
            user: UserName::from(user),
            version: ProtocolVersion::CURRENT,
            sub_requests,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    /// Client-chosen token echoed on the matching response.
    pub token: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Dependency>,
    pub request: Operation,
}

impl SubRequest {
    pub fn new(token: impl Into<String>, request: Operation) -> Self {
        Self {
            token: token.into(),
            priority: 0,
            depends_on: None,
            request,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depending_on(mut self, token: impl Into<String>, kind: DependencyKind) -> Self {
        self.depends_on = Some(Dependency {
            token: token.into(),
            kind,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub token: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    ExclusiveLock(ExclusiveLockOp),
    SchemaLock(SharedLockOp<SchemaLockRequestType>),
    Coauth(SharedLockOp<CoauthRequestType>),
    Cell(CellOp),
    ServerTime,
    WhoAmI,
    #[serde(other)]
    Unsupported,
}

impl Operation {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExclusiveLock(_) => "exclusive_lock",
            Self::SchemaLock(_) => "schema_lock",
            Self::Coauth(_) => "coauth",
            Self::Cell(op) => match op.body {
                CellBody::PutChanges(_) => "put_changes",
                CellBody::QueryChanges(_) => "query_changes",
                CellBody::Upload(_) => "upload",
                CellBody::Download => "download",
            },
            Self::ServerTime => "server_time",
            Self::WhoAmI => "who_am_i",
            Self::Unsupported => "unsupported",
        }
    }

    /// The put options, if this is a PutChanges sub-request.
    pub fn put_changes(&self) -> Option<&PutChanges> {
        match self {
            Self::Cell(CellOp {
                body: CellBody::PutChanges(put),
                ..
            }) => Some(put),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lock sub-requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusiveLockRequestType {
    GetLock,
    ReleaseLock,
    RefreshLock,
    CheckLockAvailability,
    ConvertToSchema,
    ConvertToSchemaJoinCoauth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExclusiveLockOp {
    #[serde(default)]
    pub request_type: Option<ExclusiveLockRequestType>,
    #[serde(default)]
    pub exclusive_lock_id: String,
    /// Target of ConvertToSchema*.
    #[serde(default)]
    pub schema_lock_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ExclusiveLockOp {
    pub fn new(request_type: ExclusiveLockRequestType, exclusive_lock_id: &str) -> Self {
        Self {
            request_type: Some(request_type),
            exclusive_lock_id: exclusive_lock_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaLockRequestType {
    GetLock,
    ReleaseLock,
    RefreshLock,
    ConvertToExclusive,
    CheckLockAvailability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoauthRequestType {
    JoinCoauthoring,
    ExitCoauthoring,
    RefreshCoauthoring,
    ConvertToExclusive,
    CheckLockAvailability,
    MarkTransitionComplete,
    GetCoauthoringStatus,
}

/// Schema-lock and co-authoring sub-requests share their fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedLockOp<K> {
    #[serde(default = "none")]
    pub request_type: Option<K>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub schema_lock_id: String,
    /// Target of ConvertToExclusive; defaults to the schema lock id.
    #[serde(default)]
    pub exclusive_lock_id: String,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub allow_fallback_to_exclusive: bool,
    #[serde(default)]
    pub release_lock_on_conversion_to_exclusive_failure: bool,
}

fn none<K>() -> Option<K> {
    None
}

impl<K> SharedLockOp<K> {
    pub fn new(request_type: K, client_id: &str, schema_lock_id: &str) -> Self {
        Self {
            request_type: Some(request_type),
            client_id: client_id.to_string(),
            schema_lock_id: schema_lock_id.to_string(),
            exclusive_lock_id: String::new(),
            timeout: None,
            allow_fallback_to_exclusive: false,
            release_lock_on_conversion_to_exclusive_failure: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Cell sub-requests
// ---------------------------------------------------------------------------

/// Attributes shared by every cell sub-request, plus its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellOp {
    #[serde(default = "Uuid::nil")]
    pub partition_id: Uuid,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub expect_no_file_exists: bool,
    #[serde(default)]
    pub schema_lock_id: Option<String>,
    #[serde(default)]
    pub exclusive_lock_id: Option<String>,
    #[serde(default)]
    pub coalesce: bool,
    #[serde(default)]
    pub get_file_props: bool,
    /// Overrides the modification time recorded on commit (ms since epoch).
    #[serde(default)]
    pub last_modified_time: Option<u64>,
    pub body: CellBody,
}

impl CellOp {
    pub fn new(body: CellBody) -> Self {
        Self {
            partition_id: Uuid::nil(),
            etag: None,
            expect_no_file_exists: false,
            schema_lock_id: None,
            exclusive_lock_id: None,
            coalesce: false,
            get_file_props: false,
            last_modified_time: None,
            body,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.body, CellBody::PutChanges(_) | CellBody::Upload(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellBody {
    PutChanges(PutChanges),
    QueryChanges(QueryChanges),
    Upload(Upload),
    Download,
}

/// Flags of a PutChanges sub-request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PutOptions {
    pub imply_null_expected_if_no_mapping: bool,
    pub favor_coherency_failure_over_not_found: bool,
    pub require_storage_mappings_rooted: bool,
    pub check_for_id_reuse: bool,
    pub coherency_check_only_applied_index_entries: bool,
    pub full_file_replace: bool,
    pub return_applied_storage_index_entries: bool,
    pub return_data_elements_added: bool,
    pub abort_remaining_put_changes_on_failure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutChanges {
    #[serde(default)]
    pub elements: Vec<DataElement>,
    /// Pieces of elements too large to send whole.
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    #[serde(default)]
    pub mappings: BTreeMap<CellKey, ExtendedId>,
    #[serde(default)]
    pub expected_index_id: Option<ExtendedId>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub partial_last: bool,
    /// Server-assigned id of an unfinished partial put.
    #[serde(default)]
    pub partial_id: Option<Uuid>,
    #[serde(default)]
    pub options: PutOptions,
}

/// What the caller already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Knowledge {
    #[serde(default)]
    pub elements: BTreeSet<ExtendedId>,
    /// Payload bytes already received of partially delivered elements.
    #[serde(default)]
    pub fragments: BTreeMap<ExtendedId, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    /// When non-empty, only these kinds are returned.
    pub include_kinds: Vec<DataElementKind>,
    pub exclude_kinds: Vec<DataElementKind>,
    /// When non-empty, the walk starts at these ids instead of the index.
    pub element_ids: Vec<ExtendedId>,
}

impl QueryFilter {
    pub fn admits(&self, kind: DataElementKind) -> bool {
        (self.include_kinds.is_empty() || self.include_kinds.contains(&kind))
            && !self.exclude_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryChanges {
    #[serde(default)]
    pub knowledge: Knowledge,
    #[serde(default)]
    pub filter: QueryFilter,
    #[serde(default)]
    pub allow_fragments: bool,
    #[serde(default)]
    pub include_filtered_out_data_elements_in_knowledge: bool,
    /// Caller's page cap; bounded by the server's.
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Upload {
    pub content: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub code: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub url: String,
    /// Set when the batch was rejected before any sub-request ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_error: Option<BatchFailure>,
    /// One entry per sub-request, in submission order.
    pub results: Vec<SubResponse>,
}

impl BatchResponse {
    pub fn result(&self, token: &str) -> Option<&SubResponse> {
        self.results.iter().find(|r| r.token == token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResponse {
    pub token: String,
    pub outcome: SubOutcome,
}

impl SubResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SubOutcome::Success(_))
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match &self.outcome {
            SubOutcome::Error(e) => Some(*e),
            SubOutcome::Success(_) => None,
        }
    }

    pub fn data(&self) -> Option<&SubResponseData> {
        match &self.outcome {
            SubOutcome::Success(d) => Some(d),
            SubOutcome::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubOutcome {
    Success(SubResponseData),
    Error(ErrorKind),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubResponseData {
    Lock(LockGrant),
    Cell(CellResult),
    ServerTime { now_ms: u64 },
    WhoAmI { user: UserName },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProps {
    pub created_ms: u64,
    pub modified_ms: u64,
    #[serde(default)]
    pub modified_by: Option<UserName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellResult {
    /// File version after the sub-request.
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesce_hresult: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_props: Option<FileProps>,
    pub body: CellResultBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellResultBody {
    Put(PutResult),
    /// A partial put fragment was buffered; nothing was committed.
    PartialPending { partial_id: Uuid },
    Query(QueryResult),
    Download { content: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub index_id: ExtendedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_entries: Option<BTreeMap<CellKey, ExtendedId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_elements_added: Option<Vec<ExtendedId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub index: StorageIndex,
    pub elements: Vec<DataElement>,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    /// More data remains; query again with `knowledge`.
    pub partial: bool,
    pub knowledge: Knowledge,
}
