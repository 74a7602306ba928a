// ── Switch-control messages ──
//
// The subset of the switch-control conversation the agent takes part in.
// Frames are length-delimited JSON documents; the datapath side of the
// protocol is an external collaborator and only has to agree on these
// shapes.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::warn;

use crate::error::ProtoError;
use crate::mac::MacAddr;

/// Largest frame accepted from a switch (headers + a jumbo frame).
const MAX_FRAME_LEN: usize = 64 * 1024;

// ── Inbound (switch → agent) ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchMessage {
    /// First message on a connection.
    Hello { datapath_id: u64 },

    /// A datapath port appeared, changed, or went away.
    PortStatus {
        port_no: u32,
        name: String,
        #[serde(default)]
        external_ids: BTreeMap<String, String>,
        #[serde(default)]
        removed: bool,
    },

    /// A frame that matched no installed flow.
    PacketIn {
        buffer_id: Option<u32>,
        in_port: u32,
        #[serde(with = "hex_bytes")]
        frame: Bytes,
    },
}

// ── Outbound (agent → switch) ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Gre,
    Ipsec,
    Capwap,
}

/// Exact-match flow key; `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    pub in_port: Option<u32>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ethertype: Option<u16>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    pub nw_proto: Option<u8>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowAction {
    Output { port_no: u32 },
    SetEthSrc { mac: MacAddr },
    SetEthDst { mac: MacAddr },
    SetNwSrc { addr: Ipv4Addr },
    SetNwDst { addr: Ipv4Addr },
    DecTtl,
    Tunnel {
        kind: TunnelKind,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        key: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Install a flow; the buffered packet, if any, is released through it.
    FlowMod {
        #[serde(rename = "match")]
        flow_match: FlowMatch,
        actions: Vec<FlowAction>,
        idle_timeout_secs: u16,
        buffer_id: Option<u32>,
    },

    /// Send one packet without installing state.
    PacketOut {
        buffer_id: Option<u32>,
        in_port: Option<u32>,
        actions: Vec<FlowAction>,
        #[serde(with = "hex_bytes")]
        frame: Bytes,
    },

    /// Remove every flow the agent installed on this datapath.
    FlushFlows,
}

// ── Codec ───────────────────────────────────────────────────────────

/// Length-delimited JSON framing for the switch-control channel.
///
/// Decodes [`SwitchMessage`]s and encodes [`ControllerMessage`]s. A
/// companion switch side simply swaps the two.
#[derive(Debug)]
pub struct SwitchCodec {
    frames: LengthDelimitedCodec,
}

impl Default for SwitchCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

/// A frame whose JSON fails to decode is logged and skipped. Framing
/// errors still fail.
impl Decoder for SwitchCodec {
    type Item = SwitchMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(frame) = self.frames.decode(src)? {
            match serde_json::from_slice(&frame) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!(error = %e, len = frame.len(), "skipping undecodable switch message"),
            }
        }
        Ok(None)
    }
}

impl Encoder<ControllerMessage> for SwitchCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: ControllerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

/// The datapath end of the channel: decodes what the agent sends and
/// encodes what a switch sends. Used by switch simulators and tests.
#[derive(Debug)]
pub struct DatapathCodec {
    frames: LengthDelimitedCodec,
}

impl Default for DatapathCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for DatapathCodec {
    type Item = ControllerMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<SwitchMessage> for DatapathCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: SwitchMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

/// Raw frames travel as lowercase hex strings inside the JSON envelope.
mod hex_bytes {
    use std::fmt::Write;

    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        let mut text = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(text, "{b:02x}");
        }
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                text.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| serde::de::Error::custom("invalid hex digit"))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packet_in_crosses_the_codec_pair() {
        let msg = SwitchMessage::PacketIn {
            buffer_id: Some(42),
            in_port: 3,
            frame: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        };
        let mut wire = BytesMut::new();
        DatapathCodec::default().encode(msg.clone(), &mut wire).unwrap();

        let decoded = SwitchCodec::default().decode(&mut wire).unwrap();
        assert_eq!(decoded, Some(msg));
        assert!(wire.is_empty());
    }

    #[test]
    fn flow_mod_uses_match_key_on_the_wire() {
        let msg = ControllerMessage::FlowMod {
            flow_match: FlowMatch {
                in_port: Some(1),
                ..FlowMatch::default()
            },
            actions: vec![FlowAction::Output { port_no: 2 }],
            idle_timeout_secs: 60,
            buffer_id: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "flow_mod");
        assert_eq!(json["match"]["in_port"], 1);
        assert_eq!(json["actions"][0]["action"], "output");
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut wire = BytesMut::new();
        DatapathCodec::default()
            .encode(SwitchMessage::Hello { datapath_id: 7 }, &mut wire)
            .unwrap();
        let mut head = wire.split_to(wire.len() - 1);

        let mut codec = SwitchCodec::default();
        assert_eq!(codec.decode(&mut head).unwrap(), None);
        head.extend_from_slice(&wire);
        assert_eq!(
            codec.decode(&mut head).unwrap(),
            Some(SwitchMessage::Hello { datapath_id: 7 })
        );
    }

    #[test]
    fn garbage_json_is_skipped() {
        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(b"{not json"), &mut wire)
            .unwrap();
        DatapathCodec::default()
            .encode(SwitchMessage::Hello { datapath_id: 9 }, &mut wire)
            .unwrap();

        let decoded = SwitchCodec::default().decode(&mut wire).unwrap();
        assert_eq!(decoded, Some(SwitchMessage::Hello { datapath_id: 9 }));
        assert!(wire.is_empty());
    }

    #[test]
    fn oversized_frame_is_a_framing_error() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&u32::try_from(MAX_FRAME_LEN + 1).unwrap().to_be_bytes());
        let err = SwitchCodec::default().decode(&mut wire).unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn garbage_json_is_a_decode_error_on_the_datapath_side() {
        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(b"{not json"), &mut wire)
            .unwrap();
        let err = DatapathCodec::default().decode(&mut wire).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));
    }
}
