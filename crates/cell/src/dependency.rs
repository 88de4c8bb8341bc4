//! Dependency resolution between sub-requests of one batch.
//!
//! A sub-request may name one other sub-request of the same batch and a
//! condition on its outcome. The condition is evaluated against the recorded
//! outcome just before dispatch; a skipped sub-request never touches lock or
//! storage state.

use crate::request::SubRequest;
use cellstore_common::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    OnExecute,
    OnSuccess,
    OnFail,
    OnNotSupported,
    OnSuccessOrNotSupported,
    /// Any kind this server does not recognise.
    #[serde(other)]
    Invalid,
}

/// Recorded result of a sub-request, as seen by its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(ErrorKind),
    /// The operation kind is not supported by this server.
    NotSupported,
    /// Not executed; carries the error reported for it.
    Skipped(ErrorKind),
}

impl Outcome {
    pub fn from_result<T>(result: &Result<T, ErrorKind>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(ErrorKind::RequestNotSupported) => Self::NotSupported,
            Err(e) => Self::Failed(*e),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Succeeded)
    }

    pub fn was_executed(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Execute,
    Skip(ErrorKind),
}

/// Decide whether a dependent runs, given the outcome it depends on.
pub fn evaluate(kind: DependencyKind, dependency: &Outcome) -> Decision {
    let (run, error) = match kind {
        DependencyKind::OnSuccess => (
            !dependency.is_error(),
            ErrorKind::DependentOnlyOnSuccessRequestFailed,
        ),
        DependencyKind::OnFail => (
            dependency.is_error(),
            ErrorKind::DependentOnlyOnFailRequestSucceeded,
        ),
        DependencyKind::OnNotSupported => (
            matches!(dependency, Outcome::NotSupported),
            ErrorKind::DependentOnlyOnNotSupportedRequestGetSupported,
        ),
        DependencyKind::OnSuccessOrNotSupported => (
            matches!(dependency, Outcome::Succeeded | Outcome::NotSupported),
            ErrorKind::DependentOnlyOnSuccessRequestFailed,
        ),
        DependencyKind::OnExecute => (
            dependency.was_executed(),
            ErrorKind::DependentRequestNotExecuted,
        ),
        DependencyKind::Invalid => (false, ErrorKind::InvalidRequestDependencyType),
    };
    if run {
        Decision::Execute
    } else {
        Decision::Skip(error)
    }
}

// ---------------------------------------------------------------------------
// Batch validation and ordering
// ---------------------------------------------------------------------------

/// A batch rejected before any sub-request ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("unsupported protocol version {major}.{minor}")]
    IncompatibleVersion { major: u16, minor: u16 },
    #[error("sub-request {0} has an empty token")]
    EmptyToken(usize),
    #[error("duplicate token {0:?}")]
    DuplicateToken(String),
    #[error("{token:?} depends on unknown token {depends_on:?}")]
    UnknownDependency { token: String, depends_on: String },
    #[error("dependency cycle involving {0:?}")]
    DependencyCycle(String),
}

impl BatchError {
    pub fn code(&self) -> ErrorKind {
        match self {
            Self::IncompatibleVersion { .. } => ErrorKind::IncompatibleVersion,
            _ => ErrorKind::InvalidArgument,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::IncompatibleVersion { .. } => "incompatible_version",
            Self::EmptyToken(_) => "empty_token",
            Self::DuplicateToken(_) => "duplicate_token",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::DependencyCycle(_) => "dependency_cycle",
        }
    }
}

/// Order in which the sub-requests run, as indexes into `subs`.
///
/// Ascending priority, ties by submission order; a sub-request is held back
/// until the one it depends on has run.
pub fn execution_order(subs: &[SubRequest]) -> Result<Vec<usize>, BatchError> {
    let mut by_token: HashMap<&str, usize> = HashMap::with_capacity(subs.len());
    for (i, sub) in subs.iter().enumerate() {
        if sub.token.trim().is_empty() {
            return Err(BatchError::EmptyToken(i));
        }
        if by_token.insert(sub.token.as_str(), i).is_some() {
            return Err(BatchError::DuplicateToken(sub.token.clone()));
        }
    }

    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut ready = BTreeSet::new();
    for (i, sub) in subs.iter().enumerate() {
        match &sub.depends_on {
            None => {
                ready.insert((sub.priority, i));
            }
            Some(dep) => {
                let target = by_token.get(dep.token.as_str()).copied().ok_or_else(|| {
                    BatchError::UnknownDependency {
                        token: sub.token.clone(),
                        depends_on: dep.token.clone(),
                    }
                })?;
                dependents.entry(target).or_default().push(i);
            }
        }
    }

    let mut order = Vec::with_capacity(subs.len());
    while let Some((_, i)) = ready.pop_first() {
        order.push(i);
        if let Some(waiting) = dependents.remove(&i) {
            ready.extend(waiting.into_iter().map(|d| (subs[d].priority, d)));
        }
    }

    if order.len() < subs.len() {
        let stuck = (0..subs.len())
            .find(|i| !order.contains(i))
            .map(|i| subs[i].token.clone())
            .unwrap_or_default();
        return Err(BatchError::DependencyCycle(stuck));
    }
    Ok(order)
}
