// ── Filtering policy ──
//
// Chains, their rules, and the address groups rules match against.
// A rule names its chain and its position; the snapshot orders rules
// by position.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use vrn_proto::MacAddr;

use super::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
}

/// Field rewrite applied to a packet that keeps traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum Rewrite {
    NwSrc { addr: Ipv4Addr },
    NwDst { addr: Ipv4Addr },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Drop,
    /// Like drop; kept distinct so the classification says why.
    Reject,
    /// Non-terminating: optionally rewrite, then evaluate the next rule.
    Continue {
        #[serde(default)]
        rewrite: Option<Rewrite>,
    },
    Jump { chain_id: EntityId },
    /// Leave a jumped-to chain and resume in the caller.
    Return,
}

/// Inclusive transport port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Every set field must match. Each field has its own inversion flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    pub in_ports: Vec<EntityId>,
    pub inv_in_ports: bool,
    pub dl_src: Option<MacAddr>,
    pub inv_dl_src: bool,
    pub dl_dst: Option<MacAddr>,
    pub inv_dl_dst: bool,
    pub ethertype: Option<u16>,
    pub inv_ethertype: bool,
    pub nw_src: Option<Ipv4Net>,
    pub inv_nw_src: bool,
    pub nw_dst: Option<Ipv4Net>,
    pub inv_nw_dst: bool,
    pub ip_addr_group_src: Option<EntityId>,
    pub inv_ip_addr_group_src: bool,
    pub ip_addr_group_dst: Option<EntityId>,
    pub inv_ip_addr_group_dst: bool,
    pub nw_proto: Option<u8>,
    pub inv_nw_proto: bool,
    pub tp_src: Option<PortRange>,
    pub inv_tp_src: bool,
    pub tp_dst: Option<PortRange>,
    pub inv_tp_dst: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: EntityId,
    pub chain_id: EntityId,
    /// Evaluation order within the chain.
    pub position: u32,
    #[serde(default)]
    pub condition: RuleCondition,
    pub action: RuleAction,
}

/// Named, versioned set of address prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddrGroup {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    /// Store version of the node this group was read from.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub members: BTreeSet<IpNet>,
}

impl IpAddrGroup {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = std::net::IpAddr::V4(addr);
        self.members.iter().any(|net| net.contains(&addr))
    }
}
