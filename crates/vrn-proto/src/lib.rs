// vrn-proto: Contracts the VRN agent consumes from its collaborators
// (topology directory, packet codec, switch-control framing)

pub mod directory;
pub mod error;
pub mod mac;
pub mod packet;
pub mod switch;

pub use directory::{MemoryDirectory, SessionEvent, TopologyStore, WatchEvent, WatchKind, WatchSender};
pub use error::{DirectoryError, Layer, ParseError, ProtoError};
pub use mac::MacAddr;
pub use packet::{
    ArpOp, ArpPacket, EthPayload, IcmpMessage, IpPayload, Ipv4Packet, Packet, TcpSegment,
    UdpDatagram,
};
pub use switch::{
    ControllerMessage, DatapathCodec, FlowAction, FlowMatch, SwitchCodec, SwitchMessage,
    TunnelKind,
};
