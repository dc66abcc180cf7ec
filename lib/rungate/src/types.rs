//! Wire and storage types shared by the broker, the gateway and leaf services

use serde::{Deserialize, Serialize};

/// One deployed version of a service as recorded in the store.
///
/// `parent_hash` is only set on triaged entries and names the active hash the
/// entry will replace once that version drains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub name: String,
    pub url: String,
    pub hash: String,
    /// Printed SDL of this version
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
}

impl ServiceEntry {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        hash: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            hash: hash.into(),
            schema: schema.into(),
            parent_hash: None,
        }
    }

    pub fn with_parent(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = Some(parent_hash.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub gateway: String,
    /// Accepted for compatibility with announcers that send it; unused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    RegistrationSuccess,
    DeRegistrationSuccess,
}

/// What a successful registration did to the gateway's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationOutcome {
    /// First service of a gateway; the registry was created.
    Bootstrapped,
    /// Another instance of an already active or already triaged version.
    InstanceAdded,
    /// New name appended to the active registry.
    Added,
    /// Non-breaking replacement swapped in immediately.
    Swapped,
    /// Breaking replacement parked until the active version drains.
    Triaged,
}

/// What a successful deregistration did to the gateway's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeregistrationOutcome {
    /// Other instances of the version are still running.
    InstanceRemoved,
    /// Last instance of a triaged version exited; the pending rollout was withdrawn.
    TriageWithdrawn,
    /// Last instance of an active version exited and it had no successor.
    Removed,
    /// Last instance of an active version exited and its successor went live.
    Promoted,
    /// The hash is no longer referenced by any entry.
    Untracked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub status: RegistrationStatus,
    pub name: String,
    pub url: String,
    pub hash: String,
    pub gateway: String,
    pub outcome: RegistrationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregistrationResponse {
    pub status: RegistrationStatus,
    pub name: String,
    pub hash: String,
    pub gateway: String,
    pub outcome: DeregistrationOutcome,
    /// Hash that became active, when the deregistration completed a rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    Locked,
    BadGateway,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
}
