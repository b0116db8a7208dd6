//! Payload types exchanged between stages and handed to the queue.

use crate::error::Error;
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};

/// Opaque scan destination (a host, an address, a CIDR block, ...).
///
/// The pipeline never inspects targets; it only groups them.
pub type Target = String;

/// A single TCP/UDP/SCTP port.
pub type Port = u16;

/// An ordered group of items produced by a [`Chunker`](crate::Chunker).
pub type Batch<T> = Vec<T>;

/// Tags that never carry a port dimension unless told otherwise.
const PORTLESS_TAGS: &[&str] = &["icmp", "icmpv6", "arp", "ping"];

/// A protocol tag and whether work for it is split across ports.
///
/// The tag doubles as the queue topic the work units are pushed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol {
    tag: String,
    port_scoped: bool,
}

impl Protocol {
    /// A protocol whose work units carry a port batch.
    pub fn with_ports(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            port_scoped: true,
        }
    }

    /// A protocol whose work units never carry a port batch.
    pub fn portless(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            port_scoped: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Topic name used on the queue for this protocol.
    pub fn topic(&self) -> &str {
        &self.tag
    }

    pub const fn is_port_scoped(&self) -> bool {
        self.port_scoped
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port_scoped {
            f.write_str(&self.tag)
        } else {
            write!(f, "{}:noports", self.tag)
        }
    }
}

/// Parses `tcp`, `icmp`, or `custom:noports`.
///
/// Well-known port-less tags (`icmp`, `icmpv6`, `arp`, `ping`) are port-less
/// without the suffix. Tags are lower-cased.
impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (tag, forced_portless) = match s.split_once(':') {
            Some((tag, "noports")) => (tag, true),
            Some((_, suffix)) => {
                return Err(Error::invalid(format!(
                    "unknown protocol suffix `{suffix}` in `{s}`"
                )));
            }
            None => (s, false),
        };

        if tag.is_empty() {
            return Err(Error::invalid("protocol tag must not be empty"));
        }

        let tag = tag.to_ascii_lowercase();
        if forced_portless || PORTLESS_TAGS.contains(&tag.as_str()) {
            Ok(Self::portless(tag))
        } else {
            Ok(Self::with_ports(tag))
        }
    }
}

/// The unit delivered to the queue.
///
/// Serialized as
/// `{"targets":["10.0.0.1"],"ports":[22,80],"protocol":"tcp"}`; port-less
/// protocols serialize `"ports":null`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub targets: Batch<Target>,
    pub ports: Option<Batch<Port>>,
    pub protocol: String,
}

impl WorkUnit {
    /// Number of (target, port) probes this unit represents. Port-less units
    /// count one probe per target.
    pub fn probes(&self) -> usize {
        self.targets.len() * self.ports.as_ref().map_or(1, Vec::len)
    }
}
