//! Name syntax (component A / §6): `[/<endpoint>]/<component>(/<component>)*`.
//!
//! A name is either rooted at an endpoint string (`/@5@...@@/a/b`) or at a
//! `host:port` pair (`/host:port/a/b`), or else relative to one of the
//! process's configured namespace roots. Leading double slashes and interior
//! empty components are collapsed; `..` is never special — names never
//! escape upward.

use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, EndpointError};

/// A parsed name: an optional root and a sequence of path components.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name {
    /// The root this name is anchored at, if any.
    pub root: Option<NameRoot>,
    /// Path components, already collapsed (no empty components).
    pub components: Vec<String>,
}

/// What a name is rooted at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameRoot {
    /// Rooted at a parsed endpoint.
    Endpoint(Endpoint),
    /// Rooted at a bare `host:port` pair (protocol implied by context).
    HostPort(String),
}

/// Errors raised by name parsing.
#[derive(Debug, thiserror::Error)]
pub enum NameError {
    /// The name string is not well-formed.
    #[error("malformed name: {0}")]
    MalformedName(String),
}

impl crate::error::IntoFabricError for NameError {
    fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::MalformedName
    }
}

impl Name {
    /// Parse a name string.
    ///
    /// A name beginning with `/@` is rooted at an endpoint; the endpoint
    /// runs up to (and including) its own `@@` terminator, after which the
    /// remainder is the suffix path. A name beginning with `/host:port/` is
    /// rooted at that host:port. Anything else is relative.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        let collapsed = collapse_slashes(s);

        if let Some(rest) = collapsed.strip_prefix("/@") {
            let end = rest.find("@@").ok_or_else(|| {
                NameError::MalformedName("endpoint-rooted name missing '@@' terminator".to_string())
            })?;
            let endpoint_str = format!("@{}", &rest[..end + 2]);
            let endpoint = Endpoint::parse(&endpoint_str)
                .map_err(|e: EndpointError| NameError::MalformedName(e.to_string()))?;
            let suffix = &rest[end + 2..];
            let components = split_components(suffix);
            return Ok(Name {
                root: Some(NameRoot::Endpoint(endpoint)),
                components,
            });
        }

        if let Some(rest) = collapsed.strip_prefix('/') {
            if let Some((host_port, suffix)) = split_host_port_root(rest) {
                let components = split_components(suffix);
                return Ok(Name {
                    root: Some(NameRoot::HostPort(host_port)),
                    components,
                });
            }
            // Rooted with neither an endpoint nor a recognizable host:port;
            // treat the whole thing as a rooted path with no distinguished root.
            let components = split_components(rest);
            return Ok(Name {
                root: None,
                components,
            });
        }

        let components = split_components(&collapsed);
        Ok(Name {
            root: None,
            components,
        })
    }

    /// Whether this name has no remaining components below its root.
    pub fn is_root_only(&self) -> bool {
        self.components.is_empty()
    }

    /// A name is *terminal* iff it is rooted at an endpoint whose
    /// `is_mount_table` bit is false: such a name resolves directly with no
    /// further mount indirection.
    pub fn is_terminal(&self) -> bool {
        matches!(&self.root, Some(NameRoot::Endpoint(e)) if !e.is_mount_table)
    }

    /// The slash-joined suffix (path below the root), with no leading slash.
    pub fn suffix(&self) -> String {
        self.components.join("/")
    }

    /// Build a new name with the same root but a different suffix.
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Name {
            root: self.root.clone(),
            components: split_components(suffix),
        }
    }

    /// Render back to a name string.
    pub fn render(&self) -> String {
        let root_str = match &self.root {
            Some(NameRoot::Endpoint(e)) => e.format().unwrap_or_default(),
            Some(NameRoot::HostPort(hp)) => hp.clone(),
            None => String::new(),
        };
        if root_str.is_empty() {
            self.components.join("/")
        } else if self.components.is_empty() {
            format!("/{root_str}")
        } else {
            format!("/{root_str}/{}", self.components.join("/"))
        }
    }
}

/// Collapse leading double (or more) slashes and interior empty components
/// down to a single canonical separator. `..` is left untouched — it is not
/// special, it is just another path component.
fn collapse_slashes(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let leading_root = s.starts_with('/');
    let trimmed = s.trim_start_matches('/');
    if leading_root {
        format!("/{trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn split_components(s: &str) -> Vec<String> {
    s.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Recognize a `host:port` prefix: `host` may be a bracketed IPv6 literal,
/// and must be followed by `:port` before the next `/` (or end of string).
fn split_host_port_root(rest: &str) -> Option<(String, &str)> {
    let (candidate, remainder) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };
    if candidate.contains(':') && !candidate.is_empty() {
        Some((candidate.to_string(), remainder))
    } else {
        None
    }
}
