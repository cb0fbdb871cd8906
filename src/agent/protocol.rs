//! Node agent wire protocol
//!
//! JSON bodies exchanged between the controller and the agent on each node.
//! Failures travel as an [`AgentFailure`] with a tagged kind and a matching
//! HTTP status.

use crate::domain::volume::{CreateOptions, PrimitiveRef};
use crate::error::{Error, ErrorCode};
use serde::{Deserialize, Serialize};

/// Routes of the agent API
pub mod routes {
    pub const HEALTH: &str = "/v1/agent/health";
    pub const GET_PRIMITIVE: &str = "/v1/agent/primitives/get";
    pub const CREATE_PRIMITIVE: &str = "/v1/agent/primitives/create";
    pub const DELETE_PRIMITIVE: &str = "/v1/agent/primitives/delete";
    pub const EXPAND_PRIMITIVE: &str = "/v1/agent/primitives/expand";
    pub const LIST_LOGICAL_VOLUMES: &str = "/v1/agent/primitives/list";
    pub const CREATE_SNAPSHOT: &str = "/v1/agent/snapshots/create";
    pub const DELETE_SNAPSHOT: &str = "/v1/agent/snapshots/delete";
    pub const ADD_TAGS: &str = "/v1/agent/tags/add";
    pub const REMOVE_TAGS: &str = "/v1/agent/tags/remove";
    pub const SET_QUOTA: &str = "/v1/agent/quota";
    pub const CLEAN_PATH: &str = "/v1/agent/paths/clean";
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimitiveTarget {
    pub target: PrimitiveRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrimitiveBody {
    pub target: PrimitiveRef,
    pub options: CreateOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandPrimitiveBody {
    pub target: PrimitiveRef,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListLogicalVolumesBody {
    pub vg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotBody {
    pub vg: String,
    pub name: String,
    pub source: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotBody {
    pub vg: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsBody {
    pub target: PrimitiveRef,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuotaBody {
    pub path: String,
    pub soft_kib: u64,
    pub hard_kib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanPathBody {
    pub path: String,
}

// =============================================================================
// Failures
// =============================================================================

/// Failure kind carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    NotFound,
    Conflict,
    Unavailable,
    Invalid,
    Internal,
}

impl FailureKind {
    pub fn status(self) -> u16 {
        match self {
            FailureKind::NotFound => 404,
            FailureKind::Conflict => 409,
            FailureKind::Unavailable => 503,
            FailureKind::Invalid => 400,
            FailureKind::Internal => 500,
        }
    }
}

/// Error body returned by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&Error> for AgentFailure {
    fn from(err: &Error) -> Self {
        let kind = match err.code() {
            ErrorCode::NotFound => FailureKind::NotFound,
            ErrorCode::Conflict | ErrorCode::Aborted => FailureKind::Conflict,
            ErrorCode::Unavailable => FailureKind::Unavailable,
            ErrorCode::InvalidArgument | ErrorCode::Unimplemented => FailureKind::Invalid,
            ErrorCode::Internal => FailureKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl AgentFailure {
    /// Rebuild the local error for a failure returned by `address`
    pub fn into_error(self, address: &str) -> Error {
        match self.kind {
            FailureKind::NotFound => Error::not_found("primitive", self.message),
            FailureKind::Conflict => Error::Conflict(self.message),
            FailureKind::Unavailable => Error::unavailable(address, self.message),
            FailureKind::Invalid => Error::InvalidArgument(self.message),
            FailureKind::Internal => Error::Internal(self.message),
        }
    }
}
