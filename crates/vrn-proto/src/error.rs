use thiserror::Error;

/// Protocol layer a frame was being decoded at when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Layer {
    Ethernet,
    Arp,
    Ipv4,
    Icmp,
    Udp,
    Tcp,
}

/// Why a raw frame could not be turned into a [`Packet`](crate::Packet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{layer} header truncated: need {needed} bytes, have {available}")]
    Truncated {
        layer: Layer,
        needed: usize,
        available: usize,
    },

    #[error("unsupported IP version {0}")]
    BadIpVersion(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(u8),

    #[error("unsupported ARP hardware/protocol pair ({hardware:#06x}, {protocol:#06x})")]
    UnsupportedArp { hardware: u16, protocol: u16 },
}

impl ParseError {
    /// Short stable label used in drop classification logs.
    pub fn classification(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::BadIpVersion(_) => "bad-ip-version",
            Self::BadHeaderLength(_) => "bad-header-length",
            Self::UnsupportedArp { .. } => "unsupported-arp",
        }
    }
}

/// Errors raised by the topology directory contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("no node at {path}")]
    NoNode { path: String },

    #[error("node already exists at {path}")]
    NodeExists { path: String },

    #[error("parent of {path} does not exist")]
    NoParent { path: String },

    #[error("node {path} still has children")]
    NotEmpty { path: String },

    #[error("directory session is not connected")]
    ConnectionLoss,

    #[error("directory session expired")]
    SessionExpired,

    #[error("malformed node data at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Transport-level errors on a switch-control connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed switch message: {0}")]
    Decode(#[from] serde_json::Error),
}
