//! Network service messages exchanged with clients and the upstream manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kernel interface mechanism.
pub const MECHANISM_KERNEL: &str = "KERNEL";
/// Shared-memory interface mechanism.
pub const MECHANISM_MEMIF: &str = "MEMIF";
/// VXLAN tunnel mechanism.
pub const MECHANISM_VXLAN: &str = "VXLAN";
/// WireGuard tunnel mechanism.
pub const MECHANISM_WIREGUARD: &str = "WIREGUARD";

/// How a connection is attached to the workload or the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    /// Mechanism type, such as `KERNEL` or `VXLAN`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Mechanism parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
    /// A mechanism of `kind` with no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Whether the mechanism crosses nodes through a tunnel.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.kind.as_str(), MECHANISM_VXLAN | MECHANISM_WIREGUARD)
    }
}

/// One hop of a connection's path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Name of the element that added the segment.
    pub name: String,
    /// Connection ID at this hop.
    pub id: String,
    /// Token vouching for the hop.
    pub token: String,
    /// Token expiry, seconds since the Unix epoch.
    pub expires: u64,
}

/// Hops a connection has traversed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Index of the current hop.
    #[serde(default)]
    pub index: u32,
    /// Recorded hops.
    #[serde(default)]
    pub segments: Vec<PathSegment>,
}

/// A cross-connect as negotiated along the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection identifier.
    pub id: String,
    /// Requested network service.
    pub network_service: String,
    /// Selected mechanism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    /// Path through the mesh.
    #[serde(default)]
    pub path: Path,
    /// Free-form context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// Payload of `Request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceRequest {
    /// Connection being requested or refreshed.
    pub connection: Connection,
    /// Mechanisms the client can accept, in order of preference.
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}
