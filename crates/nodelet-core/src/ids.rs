//! Core identifier types for nodelet.
//!
//! Pod identity is the UID assigned by the API server (or derived from the
//! manifest for statically configured pods). Containers are identified by the
//! runtime that owns them plus the runtime-local ID.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum accepted length of a pod UID.
const MAX_UID_LEN: usize = 128;

/// Number of hex characters kept from the blake3 digest of a static pod.
const STATIC_UID_HEX_LEN: usize = 32;

/// A pod UID.
///
/// UIDs handed out by the API server are UUIDs; statically configured pods get
/// a UID derived from their manifest so that re-reading the same file yields
/// the same identity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodUid(String);

impl PodUid {
    /// Parse a `PodUid`, rejecting empty or malformed values.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty, too long, or contains characters
    /// other than ASCII alphanumerics and `-`.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_UID_LEN {
            return Err(IdError::InvalidLength {
                expected: MAX_UID_LEN,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(IdError::InvalidCharacter);
        }
        Ok(Self(value))
    }

    /// Generate a new random `PodUid`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Derive a stable UID for a statically configured pod.
    ///
    /// The UID is a blake3 digest over the node name, the source the manifest
    /// came from and the manifest bytes themselves.
    #[must_use]
    pub fn for_static_pod(node_name: &str, source: &str, manifest: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(node_name.as_bytes());
        hasher.update(source.as_bytes());
        hasher.update(manifest);

        let digest = hex::encode(hasher.finalize().as_bytes());
        Self(digest[..STATIC_UID_HEX_LEN].to_string())
    }

    /// Return the UID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PodUid({})", self.0)
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PodUid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PodUid {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PodUid> for String {
    fn from(id: PodUid) -> Self {
        id.0
    }
}

impl AsRef<str> for PodUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A container identifier as reported by a container runtime.
///
/// Rendered as `<runtime>://<id>`, e.g. `containerd://4f1c...`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId {
    runtime: String,
    id: String,
}

impl ContainerId {
    /// Create a `ContainerId` from its runtime type and runtime-local ID.
    #[must_use]
    pub fn new(runtime: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            id: id.into(),
        }
    }

    /// The runtime type that owns the container.
    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// The runtime-local container ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({self})")
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}

impl FromStr for ContainerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (runtime, id) = s.split_once("://").ok_or(IdError::InvalidContainerId)?;
        if runtime.is_empty() || id.is_empty() {
            return Err(IdError::InvalidContainerId);
        }
        Ok(Self::new(runtime, id))
    }
}

impl TryFrom<String> for ContainerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier is empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier contains a character outside the allowed set.
    #[error("identifier contains an invalid character")]
    InvalidCharacter,

    /// The input has an incorrect length.
    #[error("invalid length: expected at most {expected} characters, got {got}")]
    InvalidLength {
        /// The maximum number of characters.
        expected: usize,
        /// The actual number of characters.
        got: usize,
    },

    /// The input is not of the form `<runtime>://<id>`.
    #[error("invalid container ID, expected <runtime>://<id>")]
    InvalidContainerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_uid_accepts_uuid() {
        let raw = uuid::Uuid::new_v4().to_string();
        let uid = PodUid::new(raw.clone()).unwrap();
        assert_eq!(uid.as_str(), raw);
    }

    #[test]
    fn pod_uid_rejects_empty_and_garbage() {
        assert!(matches!(PodUid::new(""), Err(IdError::Empty)));
        assert!(matches!(
            PodUid::new("abc/def"),
            Err(IdError::InvalidCharacter)
        ));
        assert!(matches!(
            PodUid::new("a".repeat(129)),
            Err(IdError::InvalidLength { .. })
        ));
    }

    #[test]
    fn static_pod_uid_is_stable() {
        let a = PodUid::for_static_pod("node-1", "file", b"kind: Pod");
        let b = PodUid::for_static_pod("node-1", "file", b"kind: Pod");
        let c = PodUid::for_static_pod("node-2", "file", b"kind: Pod");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
        assert!(PodUid::new(a.as_str()).is_ok());
    }

    #[test]
    fn pod_uid_serde_json() {
        let uid = PodUid::generate();
        let json = serde_json::to_string(&uid).unwrap();
        let parsed: PodUid = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, parsed);

        let bad: Result<PodUid, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn container_id_parse_and_display() {
        let id: ContainerId = "containerd://abc123".parse().unwrap();
        assert_eq!(id.runtime(), "containerd");
        assert_eq!(id.id(), "abc123");
        assert_eq!(id.to_string(), "containerd://abc123");

        assert!("abc123".parse::<ContainerId>().is_err());
        assert!("://abc".parse::<ContainerId>().is_err());
    }
}
