// ── Frame codec ──
//
// Structured view of the frames the agent simulates: Ethernet II carrying
// ARP or IPv4, with ICMP/UDP/TCP decoded just far enough for flow matching.
// Anything deeper stays opaque and is carried through untouched.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Layer, ParseError};
use crate::mac::MacAddr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

const ETH_HEADER_LEN: usize = 14;
const ARP_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 4;
const UDP_HEADER_LEN: usize = 8;
const TCP_PORTS_LEN: usize = 4;

// ── Packet types ────────────────────────────────────────────────────

/// A decoded Ethernet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub payload: EthPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthPayload {
    Arp(ArpPacket),
    Ipv4(Ipv4Packet),
    Other { ethertype: u16, data: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
    Other(u16),
}

impl From<u16> for ArpOp {
    fn from(raw: u16) -> Self {
        match raw {
            1 => Self::Request,
            2 => Self::Reply,
            other => Self::Other(other),
        }
    }
}

impl From<ArpOp> for u16 {
    fn from(op: ArpOp) -> Self {
        match op {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
            ArpOp::Other(raw) => raw,
        }
    }
}

/// ARP for Ethernet/IPv4 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub tos: u8,
    pub identification: u16,
    /// Flags (top 3 bits) and fragment offset, as on the wire.
    pub flags_fragment: u16,
    pub ttl: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Bytes,
    pub payload: IpPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPayload {
    Icmp(IcmpMessage),
    Udp(UdpDatagram),
    Tcp(TcpSegment),
    Other { protocol: u8, data: Bytes },
}

/// ICMP type and code; `body` holds everything after the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpMessage {
    pub icmp_type: u8,
    pub code: u8,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Bytes,
}

/// TCP is only decoded up to the port pair; the rest of the header and the
/// payload are opaque (checksum included, recomputed by the datapath).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub rest: Bytes,
}

// ── Accessors ───────────────────────────────────────────────────────

impl Packet {
    pub fn ethertype(&self) -> u16 {
        match &self.payload {
            EthPayload::Arp(_) => ETHERTYPE_ARP,
            EthPayload::Ipv4(_) => ETHERTYPE_IPV4,
            EthPayload::Other { ethertype, .. } => *ethertype,
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Packet> {
        match &self.payload {
            EthPayload::Ipv4(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn ipv4_mut(&mut self) -> Option<&mut Ipv4Packet> {
        match &mut self.payload {
            EthPayload::Ipv4(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        match &self.payload {
            EthPayload::Arp(arp) => Some(arp),
            _ => None,
        }
    }

    /// Build an ARP request frame broadcast from `sender`.
    pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            eth_src: sender_mac,
            eth_dst: MacAddr::BROADCAST,
            payload: EthPayload::Arp(ArpPacket {
                op: ArpOp::Request,
                sender_mac,
                sender_ip,
                target_mac: MacAddr::ZERO,
                target_ip,
            }),
        }
    }

    /// Build the reply to `request`, claiming `target_ip` for `owner_mac`.
    pub fn arp_reply(request: &ArpPacket, owner_mac: MacAddr) -> Self {
        Self {
            eth_src: owner_mac,
            eth_dst: request.sender_mac,
            payload: EthPayload::Arp(ArpPacket {
                op: ArpOp::Reply,
                sender_mac: owner_mac,
                sender_ip: request.target_ip,
                target_mac: request.sender_mac,
                target_ip: request.sender_ip,
            }),
        }
    }
}

impl Ipv4Packet {
    pub fn protocol(&self) -> u8 {
        match &self.payload {
            IpPayload::Icmp(_) => IP_PROTO_ICMP,
            IpPayload::Udp(_) => IP_PROTO_UDP,
            IpPayload::Tcp(_) => IP_PROTO_TCP,
            IpPayload::Other { protocol, .. } => *protocol,
        }
    }

    /// Transport source/destination ports, when the protocol has them.
    pub fn ports(&self) -> Option<(u16, u16)> {
        match &self.payload {
            IpPayload::Udp(udp) => Some((udp.src_port, udp.dst_port)),
            IpPayload::Tcp(tcp) => Some((tcp.src_port, tcp.dst_port)),
            IpPayload::Icmp(_) | IpPayload::Other { .. } => None,
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

fn need(layer: Layer, buf: &[u8], needed: usize) -> Result<(), ParseError> {
    if buf.len() < needed {
        return Err(ParseError::Truncated {
            layer,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn get_mac(buf: &mut &[u8]) -> MacAddr {
    let mut octets = [0u8; 6];
    buf.copy_to_slice(&mut octets);
    MacAddr(octets)
}

fn get_ipv4(buf: &mut &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}

/// Decode a raw Ethernet frame.
pub fn parse(frame: &[u8]) -> Result<Packet, ParseError> {
    need(Layer::Ethernet, frame, ETH_HEADER_LEN)?;
    let mut buf = frame;
    let eth_dst = get_mac(&mut buf);
    let eth_src = get_mac(&mut buf);
    let ethertype = buf.get_u16();

    let payload = match ethertype {
        ETHERTYPE_ARP => EthPayload::Arp(parse_arp(buf)?),
        ETHERTYPE_IPV4 => EthPayload::Ipv4(parse_ipv4(buf)?),
        _ => EthPayload::Other {
            ethertype,
            data: Bytes::copy_from_slice(buf),
        },
    };

    Ok(Packet {
        eth_src,
        eth_dst,
        payload,
    })
}

fn parse_arp(mut buf: &[u8]) -> Result<ArpPacket, ParseError> {
    need(Layer::Arp, buf, ARP_LEN)?;
    let hardware = buf.get_u16();
    let protocol = buf.get_u16();
    let hlen = buf.get_u8();
    let plen = buf.get_u8();
    if hardware != 1 || protocol != ETHERTYPE_IPV4 || hlen != 6 || plen != 4 {
        return Err(ParseError::UnsupportedArp { hardware, protocol });
    }
    let op = ArpOp::from(buf.get_u16());
    let sender_mac = get_mac(&mut buf);
    let sender_ip = get_ipv4(&mut buf);
    let target_mac = get_mac(&mut buf);
    let target_ip = get_ipv4(&mut buf);
    Ok(ArpPacket {
        op,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    })
}

fn parse_ipv4(frame: &[u8]) -> Result<Ipv4Packet, ParseError> {
    need(Layer::Ipv4, frame, IPV4_MIN_HEADER_LEN)?;
    let mut buf = frame;
    let version_ihl = buf.get_u8();
    let version = version_ihl >> 4;
    if version != 4 {
        return Err(ParseError::BadIpVersion(version));
    }
    let ihl = version_ihl & 0x0f;
    let header_len = usize::from(ihl) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::BadHeaderLength(ihl));
    }
    need(Layer::Ipv4, frame, header_len)?;

    let tos = buf.get_u8();
    let total_len = usize::from(buf.get_u16());
    let identification = buf.get_u16();
    let flags_fragment = buf.get_u16();
    let ttl = buf.get_u8();
    let protocol = buf.get_u8();
    let _checksum = buf.get_u16();
    let src = get_ipv4(&mut buf);
    let dst = get_ipv4(&mut buf);
    let options = Bytes::copy_from_slice(&buf[..header_len - IPV4_MIN_HEADER_LEN]);
    buf.advance(header_len - IPV4_MIN_HEADER_LEN);

    // Trailing Ethernet padding is not part of the datagram.
    let body_len = total_len.saturating_sub(header_len).min(buf.len());
    let body = &buf[..body_len];

    let payload = match protocol {
        IP_PROTO_ICMP => IpPayload::Icmp(parse_icmp(body)?),
        IP_PROTO_UDP => IpPayload::Udp(parse_udp(body)?),
        IP_PROTO_TCP => IpPayload::Tcp(parse_tcp(body)?),
        _ => IpPayload::Other {
            protocol,
            data: Bytes::copy_from_slice(body),
        },
    };

    Ok(Ipv4Packet {
        tos,
        identification,
        flags_fragment,
        ttl,
        src,
        dst,
        options,
        payload,
    })
}

fn parse_icmp(mut buf: &[u8]) -> Result<IcmpMessage, ParseError> {
    need(Layer::Icmp, buf, ICMP_HEADER_LEN)?;
    let icmp_type = buf.get_u8();
    let code = buf.get_u8();
    let _checksum = buf.get_u16();
    Ok(IcmpMessage {
        icmp_type,
        code,
        body: Bytes::copy_from_slice(buf),
    })
}

fn parse_udp(mut buf: &[u8]) -> Result<UdpDatagram, ParseError> {
    need(Layer::Udp, buf, UDP_HEADER_LEN)?;
    let src_port = buf.get_u16();
    let dst_port = buf.get_u16();
    let _len = buf.get_u16();
    let _checksum = buf.get_u16();
    Ok(UdpDatagram {
        src_port,
        dst_port,
        payload: Bytes::copy_from_slice(buf),
    })
}

fn parse_tcp(mut buf: &[u8]) -> Result<TcpSegment, ParseError> {
    need(Layer::Tcp, buf, TCP_PORTS_LEN)?;
    let src_port = buf.get_u16();
    let dst_port = buf.get_u16();
    Ok(TcpSegment {
        src_port,
        dst_port,
        rest: Bytes::copy_from_slice(buf),
    })
}

// ── Serialization ───────────────────────────────────────────────────

/// Encode a packet back into wire bytes, recomputing IPv4 and ICMP checksums.
pub fn serialize(packet: &Packet) -> Bytes {
    let mut out = BytesMut::with_capacity(128);
    out.put_slice(&packet.eth_dst.octets());
    out.put_slice(&packet.eth_src.octets());
    out.put_u16(packet.ethertype());

    match &packet.payload {
        EthPayload::Arp(arp) => put_arp(&mut out, arp),
        EthPayload::Ipv4(ip) => put_ipv4(&mut out, ip),
        EthPayload::Other { data, .. } => out.put_slice(data),
    }
    out.freeze()
}

fn put_arp(out: &mut BytesMut, arp: &ArpPacket) {
    out.put_u16(1);
    out.put_u16(ETHERTYPE_IPV4);
    out.put_u8(6);
    out.put_u8(4);
    out.put_u16(arp.op.into());
    out.put_slice(&arp.sender_mac.octets());
    out.put_u32(arp.sender_ip.into());
    out.put_slice(&arp.target_mac.octets());
    out.put_u32(arp.target_ip.into());
}

fn put_ipv4(out: &mut BytesMut, ip: &Ipv4Packet) {
    let mut body = BytesMut::new();
    match &ip.payload {
        IpPayload::Icmp(icmp) => {
            let start = body.len();
            body.put_u8(icmp.icmp_type);
            body.put_u8(icmp.code);
            body.put_u16(0);
            body.put_slice(&icmp.body);
            let sum = checksum(&body[start..]);
            body[start + 2..start + 4].copy_from_slice(&sum.to_be_bytes());
        }
        IpPayload::Udp(udp) => {
            body.put_u16(udp.src_port);
            body.put_u16(udp.dst_port);
            body.put_u16(u16::try_from(UDP_HEADER_LEN + udp.payload.len()).unwrap_or(u16::MAX));
            // Zero checksum is legal for UDP over IPv4.
            body.put_u16(0);
            body.put_slice(&udp.payload);
        }
        IpPayload::Tcp(tcp) => {
            body.put_u16(tcp.src_port);
            body.put_u16(tcp.dst_port);
            body.put_slice(&tcp.rest);
        }
        IpPayload::Other { data, .. } => body.put_slice(data),
    }

    let options_len = ip.options.len();
    let header_len = IPV4_MIN_HEADER_LEN + options_len;
    let total_len = u16::try_from(header_len + body.len()).unwrap_or(u16::MAX);
    let ihl = u8::try_from(header_len / 4).unwrap_or(0x0f);

    let start = out.len();
    out.put_u8(0x40 | ihl);
    out.put_u8(ip.tos);
    out.put_u16(total_len);
    out.put_u16(ip.identification);
    out.put_u16(ip.flags_fragment);
    out.put_u8(ip.ttl);
    out.put_u8(ip.protocol());
    out.put_u16(0);
    out.put_u32(ip.src.into());
    out.put_u32(ip.dst.into());
    out.put_slice(&ip.options);
    let sum = checksum(&out[start..start + header_len]);
    out[start + 10..start + 12].copy_from_slice(&sum.to_be_bytes());
    out.put_slice(&body);
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !u16::try_from(sum).unwrap_or(u16::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, last])
    }

    fn icmp_echo() -> Packet {
        Packet {
            eth_src: mac(1),
            eth_dst: mac(2),
            payload: EthPayload::Ipv4(Ipv4Packet {
                tos: 0,
                identification: 7,
                flags_fragment: 0x4000,
                ttl: 64,
                src: Ipv4Addr::new(10, 0, 0, 5),
                dst: Ipv4Addr::new(10, 0, 1, 9),
                options: Bytes::new(),
                payload: IpPayload::Icmp(IcmpMessage {
                    icmp_type: 8,
                    code: 0,
                    body: Bytes::from_static(&[0, 1, 0, 1, b'p', b'i', b'n', b'g']),
                }),
            }),
        }
    }

    #[test]
    fn ipv4_header_checksum_verifies() {
        let wire = serialize(&icmp_echo());
        // A correct header sums to zero when the checksum is included.
        assert_eq!(checksum(&wire[14..34]), 0);
    }

    #[test]
    fn icmp_round_trips() {
        let packet = icmp_echo();
        let parsed = parse(&serialize(&packet)).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn arp_reply_swaps_roles() {
        let request = Packet::arp_request(mac(1), Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));
        let Some(req) = request.arp() else {
            panic!("expected ARP");
        };
        let reply = Packet::arp_reply(req, mac(9));
        let arp = reply.arp().unwrap();
        assert_eq!(arp.op, ArpOp::Reply);
        assert_eq!(arp.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(arp.target_mac, mac(1));
        assert_eq!(reply.eth_dst, mac(1));

        let parsed = parse(&serialize(&reply)).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn short_frame_is_truncated_ethernet() {
        let err = parse(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            ParseError::Truncated {
                layer: Layer::Ethernet,
                needed: 14,
                available: 10
            }
        );
        assert_eq!(err.classification(), "truncated");
    }

    #[test]
    fn wrong_ip_version_is_rejected() {
        let mut wire = serialize(&icmp_echo()).to_vec();
        wire[14] = 0x65;
        assert_eq!(parse(&wire).unwrap_err(), ParseError::BadIpVersion(6));
    }

    #[test]
    fn ethernet_padding_is_ignored() {
        let packet = Packet {
            eth_src: mac(1),
            eth_dst: mac(2),
            payload: EthPayload::Ipv4(Ipv4Packet {
                tos: 0,
                identification: 1,
                flags_fragment: 0,
                ttl: 3,
                src: Ipv4Addr::new(1, 1, 1, 1),
                dst: Ipv4Addr::new(2, 2, 2, 2),
                options: Bytes::new(),
                payload: IpPayload::Udp(UdpDatagram {
                    src_port: 5353,
                    dst_port: 53,
                    payload: Bytes::from_static(b"q"),
                }),
            }),
        };
        let mut wire = serialize(&packet).to_vec();
        wire.extend_from_slice(&[0u8; 8]);
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.ipv4().unwrap().ports(), Some((5353, 53)));
    }

    #[test]
    fn unknown_ethertype_is_opaque() {
        let mut wire = vec![0xff; 12];
        wire.extend_from_slice(&0x86ddu16.to_be_bytes());
        wire.extend_from_slice(b"v6");
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed.ethertype(), 0x86dd);
        assert_eq!(serialize(&parsed).as_ref(), wire.as_slice());
    }
}
