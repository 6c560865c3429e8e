//! Endpoint parsing and formatting (component A).
//!
//! The wire form is a printable string:
//!
//! ```text
//! @<version>@<protocol>@<address>@<routing-id-hex>@<mt-bit>@<blessing-names-comma-sep>@@
//! ```
//!
//! `<version>` is additive: newer fields may be appended in later versions,
//! but this codec only understands [`CURRENT_VERSION`]. Any other version
//! string fails to parse with [`EndpointError::MalformedEndpoint`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The only endpoint wire version this codec understands.
pub const CURRENT_VERSION: u8 = 5;

/// A 16-byte opaque identifier stable across a server's network relocations.
///
/// Two endpoints are equivalent iff their routing ids match, regardless of
/// address — except that a zero routing id is treated as equivalent to the
/// endpoint's address (see [`Endpoint::routing_key`]), an intentionally
/// preserved legacy quirk for endpoints that predate routing-id assignment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingId(pub [u8; 16]);

impl RoutingId {
    /// The all-zero routing id, used by endpoints that have not been
    /// assigned a stable identity (e.g. during early bring-up).
    pub const ZERO: RoutingId = RoutingId([0u8; 16]);

    /// Generate a random routing id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        RoutingId(bytes)
    }

    /// Whether this is the all-zero routing id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    fn from_hex(s: &str) -> Result<Self, EndpointError> {
        if s.len() != 32 {
            return Err(EndpointError::MalformedEndpoint(format!(
                "routing id must be exactly 32 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| {
            EndpointError::MalformedEndpoint(format!("invalid routing id hex: {e}"))
        })?;
        let array: [u8; 16] = bytes.try_into().map_err(|_| {
            EndpointError::MalformedEndpoint("routing id did not decode to 16 bytes".to_string())
        })?;
        Ok(RoutingId(array))
    }
}

impl fmt::Debug for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingId({})", self.to_hex())
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A fully parsed network endpoint.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    /// Wire version this endpoint was parsed at (or will be formatted at).
    pub version: u8,
    /// The transport protocol name, e.g. "tcp", "quic".
    pub protocol: String,
    /// The network address: host:port, bracketed IPv6, or similar.
    pub address: String,
    /// The routing id identifying the listening server.
    pub routing_id: RoutingId,
    /// Whether the listening server is itself a mount table.
    pub is_mount_table: bool,
    /// Blessing names the server is expected to present, if known in
    /// advance (used to narrow `BlessingStore::for_peer` before dialing).
    pub blessing_names: Vec<String>,
}

/// Errors raised by endpoint parsing and formatting.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint string is not well-formed, or its version is unknown.
    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(String),
}

impl crate::error::IntoFabricError for EndpointError {
    fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::MalformedEndpoint
    }
}

impl Endpoint {
    /// Construct a new endpoint at the current wire version.
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            version: CURRENT_VERSION,
            protocol: protocol.into(),
            address: address.into(),
            routing_id: RoutingId::ZERO,
            is_mount_table: false,
            blessing_names: Vec::new(),
        }
    }

    /// Builder: set the routing id.
    #[must_use]
    pub fn with_routing_id(mut self, routing_id: RoutingId) -> Self {
        self.routing_id = routing_id;
        self
    }

    /// Builder: mark as a mount table.
    #[must_use]
    pub fn with_mount_table(mut self, is_mount_table: bool) -> Self {
        self.is_mount_table = is_mount_table;
        self
    }

    /// Builder: set the expected blessing names.
    #[must_use]
    pub fn with_blessing_names(mut self, names: Vec<String>) -> Self {
        self.blessing_names = names;
        self
    }

    /// The key used to test equivalence between two endpoints: the routing
    /// id, unless it is zero, in which case the address stands in for it.
    ///
    /// This is an intentionally preserved legacy behavior: endpoints that
    /// have not been assigned a stable routing id are distinguished (and
    /// deduplicated) by address instead, so two freshly-started servers on
    /// different addresses are never treated as the same peer before a
    /// routing id is assigned.
    pub fn routing_key(&self) -> RoutingKey<'_> {
        if self.routing_id.is_zero() {
            RoutingKey::Address(&self.address)
        } else {
            RoutingKey::RoutingId(self.routing_id)
        }
    }

    /// Two endpoints are equivalent iff their routing keys match.
    pub fn equivalent(&self, other: &Endpoint) -> bool {
        self.routing_key() == other.routing_key()
    }

    /// Format this endpoint to its canonical wire string.
    pub fn format(&self) -> Result<String, EndpointError> {
        if self.version != CURRENT_VERSION {
            return Err(EndpointError::MalformedEndpoint(format!(
                "cannot format endpoint at unsupported version {}",
                self.version
            )));
        }
        if self.protocol.is_empty() {
            return Err(EndpointError::MalformedEndpoint(
                "protocol must not be empty".to_string(),
            ));
        }
        Ok(format!(
            "@{}@{}@{}@{}@{}@{}@@",
            self.version,
            self.protocol,
            self.address,
            self.routing_id.to_hex(),
            u8::from(self.is_mount_table),
            self.blessing_names.join(","),
        ))
    }

    /// Parse an endpoint from its canonical wire string.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let body = s
            .strip_prefix('@')
            .ok_or_else(|| EndpointError::MalformedEndpoint("missing leading '@'".to_string()))?;
        let body = body
            .strip_suffix("@@")
            .ok_or_else(|| EndpointError::MalformedEndpoint("missing trailing '@@'".to_string()))?;

        // Split into exactly 6 fields: version, protocol, address, routing-id,
        // mt-bit, blessing-names. The address itself never contains '@', so a
        // plain split is safe and also preserves any future trailing fields
        // a newer-but-still-version-5 writer might append after blessing-names.
        let fields: Vec<&str> = body.splitn(6, '@').collect();
        if fields.len() < 5 {
            return Err(EndpointError::MalformedEndpoint(format!(
                "expected at least 5 fields, got {}",
                fields.len()
            )));
        }

        let version: u8 = fields[0].parse().map_err(|_| {
            EndpointError::MalformedEndpoint(format!("invalid version field {:?}", fields[0]))
        })?;
        if version != CURRENT_VERSION {
            return Err(EndpointError::MalformedEndpoint(format!(
                "unsupported endpoint version {version}, expected {CURRENT_VERSION}"
            )));
        }

        let protocol = fields[1].to_string();
        if protocol.is_empty() {
            return Err(EndpointError::MalformedEndpoint(
                "protocol must not be empty".to_string(),
            ));
        }
        let address = fields[2].to_string();
        let routing_id = RoutingId::from_hex(fields[3])?;
        let is_mount_table = match fields[4] {
            "0" => false,
            "1" => true,
            other => {
                return Err(EndpointError::MalformedEndpoint(format!(
                    "invalid mount-table bit {other:?}"
                )))
            }
        };
        let blessing_names = fields
            .get(5)
            .map(|names| {
                if names.is_empty() {
                    Vec::new()
                } else {
                    names.split(',').map(str::to_string).collect()
                }
            })
            .unwrap_or_default();

        Ok(Endpoint {
            version,
            protocol,
            address,
            routing_id,
            is_mount_table,
            blessing_names,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "<invalid endpoint {}/{}>", self.protocol, self.address),
        }
    }
}

/// The value two endpoints are compared by for equivalence.
#[derive(Debug, PartialEq, Eq)]
pub enum RoutingKey<'a> {
    /// Compared by routing id.
    RoutingId(RoutingId),
    /// Compared by address (zero-routing-id fallback).
    Address(&'a str),
}
