//! Cell request processor: runs a batch against one file.
//!
//! The processor:
//! 1. Rejects unsupported protocol versions and malformed batches
//! 2. Orders sub-requests by priority and dependencies
//! 3. Evaluates each dependency just before dispatch
//! 4. Dispatches lock sub-requests to the file's lock and cell
//!    sub-requests to the coherency controller, under the file's mutex
//! 5. Returns one result per token, in submission order

use crate::coherency::{self, Expected, PutPlan};
use crate::content::{self, DEFAULT_CELL};
use crate::dependency::{evaluate, execution_order, BatchError, Decision, Outcome};
use crate::file::{FileRegistry, SharedFile};
use crate::request::{
    BatchFailure, BatchRequest, BatchResponse, CellBody, CellOp, CellResult, CellResultBody,
    CoauthRequestType, ExclusiveLockOp, ExclusiveLockRequestType, FileProps, Operation,
    PutOptions, PutResult, QueryResult, SchemaLockRequestType, SharedLockOp, SubOutcome,
    SubResponse, SubResponseData,
};
use cellstore_common::{now_ms, CellErrorCode, ClientId, ErrorKind, ExtendedId, LockId, UserName};
use cellstore_config::{CellConfig, ServerConfig};
use cellstore_lock::{
    ExclusiveLockRequest, FileLock, LockGrant, LockPolicy, LockType, SchemaLockRequest,
};
use cellstore_metrics::metrics;
use cellstore_storage::{ContentStore, FileHead, PartitionHead, StorageError, StorageIndex};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cell-level tunables.
#[derive(Debug, Clone)]
pub struct CellSettings {
    /// Server cap on one QueryChanges page.
    pub query_page_bytes: u64,
    /// Chunk size for whole-file uploads.
    pub upload_chunk_bytes: usize,
    /// Superseded index versions kept per partition.
    pub retained_index_versions: usize,
}

impl CellSettings {
    pub fn from_config(cell: &CellConfig) -> Self {
        Self {
            query_page_bytes: cell.query_page_bytes,
            upload_chunk_bytes: cell.upload_chunk_bytes,
            retained_index_versions: cell.retained_index_versions,
        }
    }
}

impl Default for CellSettings {
    fn default() -> Self {
        Self::from_config(&CellConfig::default())
    }
}

fn storage_failure(e: StorageError) -> ErrorKind {
    tracing::error!("content store failure: {}", e);
    ErrorKind::cell(CellErrorCode::StorageFailure)
}

fn coherency_failure() -> ErrorKind {
    ErrorKind::cell(CellErrorCode::CoherencyFailure)
}

fn lock_label(lock_type: LockType) -> &'static str {
    match lock_type {
        LockType::None => "none",
        LockType::Shared => "shared",
        LockType::Exclusive => "exclusive",
    }
}

/// A lock reference on a cell request; blank means absent.
fn lock_ref(id: &Option<String>) -> Option<LockId> {
    id.as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(LockId::from)
}

pub struct CellRequestProcessor {
    store: Arc<RwLock<ContentStore>>,
    files: FileRegistry,
    policy: LockPolicy,
    settings: CellSettings,
}

impl std::fmt::Debug for CellRequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellRequestProcessor")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CellRequestProcessor {
    pub fn new(store: Arc<RwLock<ContentStore>>, policy: LockPolicy, settings: CellSettings) -> Self {
        Self {
            store,
            files: FileRegistry::new(),
            policy,
            settings,
        }
    }

    pub fn from_config(store: Arc<RwLock<ContentStore>>, config: &ServerConfig) -> Self {
        Self::new(
            store,
            LockPolicy::from_config(&config.locks, &config.coauth),
            CellSettings::from_config(&config.cell),
        )
    }

    pub fn store(&self) -> &Arc<RwLock<ContentStore>> {
        &self.store
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Run a batch. Never fails as a whole except for batch-level errors,
    /// which are reported in `batch_error` with an empty result list.
    pub async fn process(&self, batch: BatchRequest) -> BatchResponse {
        metrics().batches.inc();

        if !batch.version.is_supported() {
            return self.reject(
                batch.url,
                BatchError::IncompatibleVersion {
                    major: batch.version.major,
                    minor: batch.version.minor,
                },
            );
        }
        let order = match execution_order(&batch.sub_requests) {
            Ok(order) => order,
            Err(e) => return self.reject(batch.url, e),
        };

        let file = self.files.get_or_create(&batch.url).await;
        let index_of: HashMap<&str, usize> = batch
            .sub_requests
            .iter()
            .enumerate()
            .map(|(i, s)| (s.token.as_str(), i))
            .collect();

        let mut outcomes: Vec<Option<Outcome>> = vec![None; batch.sub_requests.len()];
        let mut results: Vec<Option<SubResponse>> = vec![None; batch.sub_requests.len()];
        let mut puts_aborted = false;

        for i in order {
            let sub = &batch.sub_requests[i];
            let kind = sub.request.kind();
            let put_options = sub.request.put_changes().map(|p| p.options);

            let decision = match &sub.depends_on {
                _ if puts_aborted && put_options.is_some() => Decision::Skip(ErrorKind::cell(
                    CellErrorCode::AbortedAfterFailedPutChanges,
                )),
                None => Decision::Execute,
                Some(dep) => match index_of.get(dep.token.as_str()).and_then(|j| outcomes[*j]) {
                    Some(outcome) => evaluate(dep.kind, &outcome),
                    None => Decision::Skip(ErrorKind::DependentRequestNotExecuted),
                },
            };

            let (outcome, sub_outcome) = match decision {
                Decision::Skip(e) => (Outcome::Skipped(e), SubOutcome::Error(e)),
                Decision::Execute => {
                    let _timer = cellstore_metrics::start_sub_request_timer(kind);
                    let result = self.dispatch(&file, &batch.url, &batch.user, &sub.request).await;
                    let outcome = Outcome::from_result(&result);
                    match result {
                        Ok(data) => (outcome, SubOutcome::Success(data)),
                        Err(e) => {
                            if e.is_coherency_failure() {
                                metrics().coherency_failures.inc();
                            }
                            if put_options.is_some_and(|o| o.abort_remaining_put_changes_on_failure) {
                                puts_aborted = true;
                            }
                            (outcome, SubOutcome::Error(e))
                        }
                    }
                }
            };

            let label = match outcome {
                Outcome::Succeeded => "success",
                Outcome::Failed(_) => "error",
                Outcome::NotSupported => "not_supported",
                Outcome::Skipped(_) => "skipped",
            };
            cellstore_metrics::record_sub_request(kind, label);
            tracing::debug!(url = %batch.url, token = %sub.token, kind, ?outcome, "sub-request finished");

            outcomes[i] = Some(outcome);
            results[i] = Some(SubResponse {
                token: sub.token.clone(),
                outcome: sub_outcome,
            });
        }

        BatchResponse {
            url: batch.url,
            batch_error: None,
            results: results.into_iter().flatten().collect(),
        }
    }

    fn reject(&self, url: String, error: BatchError) -> BatchResponse {
        tracing::info!(%url, "batch rejected: {}", error);
        metrics()
            .batches_rejected
            .with_label_values(&[error.reason()])
            .inc();
        BatchResponse {
            url,
            batch_error: Some(BatchFailure {
                code: error.code(),
                message: error.to_string(),
            }),
            results: Vec::new(),
        }
    }

    async fn dispatch(
        &self,
        file: &SharedFile,
        url: &str,
        user: &UserName,
        op: &Operation,
    ) -> Result<SubResponseData, ErrorKind> {
        match op {
            Operation::ServerTime => Ok(SubResponseData::ServerTime { now_ms: now_ms() }),
            Operation::WhoAmI => Ok(SubResponseData::WhoAmI { user: user.clone() }),
            Operation::Unsupported => Err(ErrorKind::RequestNotSupported),
            Operation::ExclusiveLock(op) => {
                let mut record = file.lock().await;
                self.exclusive_lock(&mut record.lock, user, op)
            }
            Operation::SchemaLock(op) => {
                let mut record = file.lock().await;
                self.schema_lock(&mut record.lock, user, op)
            }
            Operation::Coauth(op) => {
                let mut record = file.lock().await;
                self.coauth(&mut record.lock, user, op)
            }
            Operation::Cell(op) => self.cell(file, url, user, op).await,
        }
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    fn note_expired(lock: &mut FileLock) {
        let expired = lock.expire();
        if expired > 0 {
            metrics().lock_expirations.inc_by(expired as u64);
        }
    }

    fn granted(grant: LockGrant) -> Result<SubResponseData, ErrorKind> {
        metrics()
            .locks_granted
            .with_label_values(&[lock_label(grant.lock_type)])
            .inc();
        Ok(SubResponseData::Lock(grant))
    }

    fn exclusive_lock(
        &self,
        lock: &mut FileLock,
        user: &UserName,
        op: &ExclusiveLockOp,
    ) -> Result<SubResponseData, ErrorKind> {
        let request_type = op.request_type.ok_or(ErrorKind::InvalidArgument)?;
        Self::note_expired(lock);
        let req = ExclusiveLockRequest {
            lock_id: LockId(op.exclusive_lock_id.clone()),
            user: user.clone(),
            timeout_secs: op.timeout,
        };
        match request_type {
            ExclusiveLockRequestType::GetLock => {
                lock.acquire_exclusive(&req, &self.policy)?;
                return Self::granted(LockGrant::current(lock));
            }
            ExclusiveLockRequestType::RefreshLock => lock.refresh_exclusive(&req, &self.policy)?,
            ExclusiveLockRequestType::ReleaseLock => lock.release_exclusive(&req)?,
            ExclusiveLockRequestType::CheckLockAvailability => {
                lock.check_exclusive_availability(&req)?
            }
            ExclusiveLockRequestType::ConvertToSchema
            | ExclusiveLockRequestType::ConvertToSchemaJoinCoauth => {
                let join = lock.convert_to_schema(
                    &req,
                    &ClientId(op.client_id.clone()),
                    &LockId(op.schema_lock_id.clone()),
                    &self.policy,
                )?;
                if request_type == ExclusiveLockRequestType::ConvertToSchemaJoinCoauth {
                    return Ok(SubResponseData::Lock(LockGrant::joined(join)));
                }
            }
        }
        Ok(SubResponseData::Lock(LockGrant::current(lock)))
    }

    fn schema_request<K>(user: &UserName, op: &SharedLockOp<K>) -> (SchemaLockRequest, LockId) {
        let req = SchemaLockRequest {
            client_id: ClientId(op.client_id.clone()),
            schema_lock_id: LockId(op.schema_lock_id.clone()),
            user: user.clone(),
            timeout_secs: op.timeout,
            allow_fallback: op.allow_fallback_to_exclusive,
        };
        let target = if op.exclusive_lock_id.trim().is_empty() {
            req.schema_lock_id.clone()
        } else {
            LockId(op.exclusive_lock_id.clone())
        };
        (req, target)
    }

    fn schema_lock(
        &self,
        lock: &mut FileLock,
        user: &UserName,
        op: &SharedLockOp<SchemaLockRequestType>,
    ) -> Result<SubResponseData, ErrorKind> {
        let request_type = op.request_type.ok_or(ErrorKind::InvalidArgument)?;
        Self::note_expired(lock);
        let (req, target) = Self::schema_request(user, op);
        match request_type {
            SchemaLockRequestType::GetLock => {
                return Self::granted(lock.acquire_shared(&req, &self.policy)?)
            }
            SchemaLockRequestType::RefreshLock => {
                return Ok(SubResponseData::Lock(lock.refresh_shared(&req, &self.policy)?))
            }
            SchemaLockRequestType::ReleaseLock => lock.release_shared(&req)?,
            SchemaLockRequestType::ConvertToExclusive => lock.convert_to_exclusive(
                &req,
                &target,
                op.release_lock_on_conversion_to_exclusive_failure,
                &self.policy,
            )?,
            SchemaLockRequestType::CheckLockAvailability => {
                lock.check_shared_availability(&req, &self.policy)?
            }
        }
        Ok(SubResponseData::Lock(LockGrant::current(lock)))
    }

    fn coauth(
        &self,
        lock: &mut FileLock,
        user: &UserName,
        op: &SharedLockOp<CoauthRequestType>,
    ) -> Result<SubResponseData, ErrorKind> {
        let request_type = op.request_type.ok_or(ErrorKind::InvalidArgument)?;
        Self::note_expired(lock);
        let (req, target) = Self::schema_request(user, op);
        match request_type {
            CoauthRequestType::JoinCoauthoring => {
                return Self::granted(lock.join_coauth(&req, &self.policy)?)
            }
            CoauthRequestType::RefreshCoauthoring => {
                return Ok(SubResponseData::Lock(lock.refresh_coauth(&req, &self.policy)?))
            }
            CoauthRequestType::ExitCoauthoring => lock.exit_coauth(&req)?,
            CoauthRequestType::ConvertToExclusive => lock.convert_to_exclusive(
                &req,
                &target,
                op.release_lock_on_conversion_to_exclusive_failure,
                &self.policy,
            )?,
            CoauthRequestType::CheckLockAvailability => {
                lock.check_shared_availability(&req, &self.policy)?
            }
            CoauthRequestType::MarkTransitionComplete => lock.mark_transition_complete(&req)?,
            CoauthRequestType::GetCoauthoringStatus => {
                lock.coauth_status(&req)?;
            }
        }
        Ok(SubResponseData::Lock(LockGrant::current(lock)))
    }

    /// Administrative checkout of `url` by `user`.
    pub async fn check_out(&self, url: &str, user: &UserName) -> Result<(), ErrorKind> {
        let file = self.files.get_or_create(url).await;
        let mut record = file.lock().await;
        record.lock.check_out(user)?;
        tracing::info!(%url, %user, "file checked out");
        Ok(())
    }

    pub async fn check_in(&self, url: &str, user: &UserName) -> Result<(), ErrorKind> {
        let file = self.files.get_or_create(url).await;
        let mut record = file.lock().await;
        record.lock.check_in(user)?;
        tracing::info!(%url, %user, "file checked in");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cells
    // -----------------------------------------------------------------------

    async fn cell(
        &self,
        file: &SharedFile,
        url: &str,
        user: &UserName,
        op: &CellOp,
    ) -> Result<SubResponseData, ErrorKind> {
        let mut record = file.lock().await;
        Self::note_expired(&mut record.lock);
        if op.is_write() {
            record.lock.permits_write(
                user,
                lock_ref(&op.schema_lock_id).as_ref(),
                lock_ref(&op.exclusive_lock_id).as_ref(),
            )?;
        }

        if op.is_write() {
            let mut store = self.store.write().await;
            Self::check_preconditions(&store, url, op)?;
            let body = match &op.body {
                CellBody::PutChanges(put) if put.partial && !put.partial_last => {
                    let partial_id = record.partials.buffer(
                        put.partial_id,
                        put.elements.clone(),
                        put.fragments.clone(),
                    )?;
                    tracing::debug!(%url, %partial_id, "buffered partial put");
                    CellResultBody::PartialPending { partial_id }
                }
                CellBody::PutChanges(put) => {
                    let elements = record.partials.finish(
                        put.partial_id,
                        put.elements.clone(),
                        put.fragments.clone(),
                    )?;
                    let current = Self::current_index(&store, url, &op.partition_id);
                    let expected =
                        Self::resolve_expected(&store, url, op, &current, put.expected_index_id);
                    let plan = coherency::plan_put(
                        &store,
                        &current,
                        &expected,
                        &elements,
                        &put.mappings,
                        &put.options,
                    )?;
                    let result = Self::put_result(&plan, &put.options);
                    let index_id = self.commit(&mut store, url, user, op, plan)?;
                    CellResultBody::Put(PutResult { index_id, ..result })
                }
                CellBody::Upload(upload) => {
                    let (root, elements) =
                        content::chunk(&upload.content, self.settings.upload_chunk_bytes);
                    let options = PutOptions {
                        full_file_replace: true,
                        ..PutOptions::default()
                    };
                    let current = Self::current_index(&store, url, &op.partition_id);
                    let mappings = BTreeMap::from([(DEFAULT_CELL, root)]);
                    let plan = coherency::plan_put(
                        &store,
                        &current,
                        &Expected::Unspecified,
                        &elements,
                        &mappings,
                        &options,
                    )?;
                    let result = Self::put_result(&plan, &options);
                    let index_id = self.commit(&mut store, url, user, op, plan)?;
                    CellResultBody::Put(PutResult { index_id, ..result })
                }
                CellBody::QueryChanges(_) | CellBody::Download => {
                    return Err(ErrorKind::InvalidArgument)
                }
            };
            return Ok(Self::cell_result(store.head(url), op, body));
        }

        let store = self.store.read().await;
        Self::check_preconditions(&store, url, op)?;
        let current = Self::current_index(&store, url, &op.partition_id);
        let body = match &op.body {
            CellBody::QueryChanges(query) => {
                let cap = query
                    .max_bytes
                    .unwrap_or(u64::MAX)
                    .min(self.settings.query_page_bytes);
                let page = coherency::plan_query(&store, &current, query, cap);
                CellResultBody::Query(QueryResult {
                    index: current,
                    elements: page.elements,
                    fragments: page.fragments,
                    partial: page.partial,
                    knowledge: page.knowledge,
                })
            }
            CellBody::Download => {
                let root = current
                    .get(&DEFAULT_CELL)
                    .ok_or(ErrorKind::FileNotExistsOrCannotBeCreated)?;
                let content = content::assemble(&root, |id| store.get(id))?;
                CellResultBody::Download { content }
            }
            CellBody::PutChanges(_) | CellBody::Upload(_) => return Err(ErrorKind::InvalidArgument),
        };
        Ok(Self::cell_result(store.head(url), op, body))
    }

    fn check_preconditions(store: &ContentStore, url: &str, op: &CellOp) -> Result<(), ErrorKind> {
        let head = store.head(url);
        if op.expect_no_file_exists && head.is_some() {
            tracing::debug!(%url, "file exists but the request expected none");
            return Err(coherency_failure());
        }
        if let Some(etag) = op.etag.as_deref().filter(|e| !e.is_empty()) {
            if head.map(|h| h.etag.as_str()) != Some(etag) {
                tracing::debug!(%url, etag, "etag mismatch");
                return Err(coherency_failure());
            }
        }
        Ok(())
    }

    fn partition_head<'a>(
        store: &'a ContentStore,
        url: &str,
        partition: &Uuid,
    ) -> Option<&'a PartitionHead> {
        store.head(url).and_then(|h| h.partition(partition))
    }

    fn current_index(store: &ContentStore, url: &str, partition: &Uuid) -> StorageIndex {
        Self::partition_head(store, url, partition)
            .and_then(|p| store.load_index(&p.index_id))
            .unwrap_or_else(StorageIndex::empty)
    }

    fn resolve_expected(
        store: &ContentStore,
        url: &str,
        op: &CellOp,
        current: &StorageIndex,
        expected: Option<ExtendedId>,
    ) -> Expected {
        let Some(id) = expected else {
            return Expected::Unspecified;
        };
        if id.is_nil() {
            return Expected::Known(StorageIndex::empty());
        }
        if id == current.id {
            return Expected::Known(current.clone());
        }
        Self::partition_head(store, url, &op.partition_id)
            .filter(|p| p.knows(&id))
            .and_then(|_| store.load_index(&id))
            .map_or(Expected::Unknown(id), Expected::Known)
    }

    fn put_result(plan: &PutPlan, options: &PutOptions) -> PutResult {
        PutResult {
            index_id: ExtendedId::NIL,
            applied_entries: options
                .return_applied_storage_index_entries
                .then(|| plan.applied.clone()),
            data_elements_added: options
                .return_data_elements_added
                .then(|| plan.added.clone()),
        }
    }

    /// Write the plan's elements, a fresh index and a new head. Returns the
    /// new index id.
    fn commit(
        &self,
        store: &mut ContentStore,
        url: &str,
        user: &UserName,
        op: &CellOp,
        plan: PutPlan,
    ) -> Result<ExtendedId, ErrorKind> {
        let stored = plan.to_insert.len();
        for element in plan.to_insert {
            store.put(element).map_err(storage_failure)?;
        }
        let index = StorageIndex::new(ExtendedId::random(), plan.mappings);
        store.put_index(&index).map_err(storage_failure)?;

        let now = now_ms();
        let mut head = store
            .head(url)
            .cloned()
            .unwrap_or_else(|| FileHead::new(url.to_string(), now));
        head.etag = Uuid::new_v4().to_string();
        head.modified_ms = op.last_modified_time.unwrap_or(now);
        head.modified_by = Some(user.clone());
        match head.partitions.entry(op.partition_id) {
            Entry::Occupied(mut e) => e
                .get_mut()
                .advance(index.id, self.settings.retained_index_versions),
            Entry::Vacant(e) => {
                e.insert(PartitionHead {
                    index_id: index.id,
                    history: Vec::new(),
                });
            }
        }
        store.commit_head(head).map_err(storage_failure)?;

        metrics().index_commits.inc();
        metrics().elements_stored.inc_by(stored as u64);
        tracing::debug!(%url, index_id = %index.id, stored, "committed storage index");
        Ok(index.id)
    }

    fn cell_result(head: Option<&FileHead>, op: &CellOp, body: CellResultBody) -> SubResponseData {
        SubResponseData::Cell(CellResult {
            etag: head.map(|h| h.etag.clone()).unwrap_or_default(),
            coalesce_hresult: op.coalesce.then_some(0),
            file_props: head.filter(|_| op.get_file_props).map(|h| FileProps {
                created_ms: h.created_ms,
                modified_ms: h.modified_ms,
                modified_by: h.modified_by.clone(),
            }),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ProtocolVersion, SubRequest};
    use cellstore_storage::FsyncPolicy;
    use tempfile::TempDir;

    fn processor() -> (TempDir, CellRequestProcessor) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
        let p = CellRequestProcessor::new(
            Arc::new(RwLock::new(store)),
            LockPolicy::default(),
            CellSettings::default(),
        );
        (dir, p)
    }

    #[tokio::test]
    async fn test_incompatible_version_dispatches_nothing() {
        let (_d, p) = processor();
        let mut batch = BatchRequest::new(
            "/a.docx",
            "alice",
            vec![SubRequest::new(
                "1",
                Operation::ExclusiveLock(ExclusiveLockOp::new(
                    ExclusiveLockRequestType::GetLock,
                    "L",
                )),
            )],
        );
        batch.version = ProtocolVersion { major: 3, minor: 0 };
        let resp = p.process(batch).await;
        assert_eq!(
            resp.batch_error.map(|e| e.code),
            Some(ErrorKind::IncompatibleVersion)
        );
        assert!(resp.results.is_empty());
        assert!(p.files().get("/a.docx").await.is_none());
    }

    #[tokio::test]
    async fn test_misc_sub_requests() {
        let (_d, p) = processor();
        let batch = BatchRequest::new(
            "/a.docx",
            "alice",
            vec![
                SubRequest::new("t", Operation::ServerTime),
                SubRequest::new("w", Operation::WhoAmI),
                SubRequest::new("u", Operation::Unsupported),
            ],
        );
        let resp = p.process(batch).await;
        assert!(matches!(
            resp.result("t").and_then(|r| r.data()),
            Some(SubResponseData::ServerTime { now_ms }) if *now_ms > 0
        ));
        assert!(matches!(
            resp.result("w").and_then(|r| r.data()),
            Some(SubResponseData::WhoAmI { user }) if user.0 == "alice"
        ));
        assert_eq!(
            resp.result("u").and_then(|r| r.error()),
            Some(ErrorKind::RequestNotSupported)
        );
    }

    #[tokio::test]
    async fn test_missing_request_type_is_invalid_argument() {
        let (_d, p) = processor();
        let op = ExclusiveLockOp {
            exclusive_lock_id: "L".to_string(),
            ..ExclusiveLockOp::default()
        };
        let resp = p
            .process(BatchRequest::new(
                "/a.docx",
                "alice",
                vec![SubRequest::new("1", Operation::ExclusiveLock(op))],
            ))
            .await;
        assert_eq!(resp.results[0].error(), Some(ErrorKind::InvalidArgument));
    }
}
