// ── Chain evaluation ──
//
// Rules run in position order. The first matching accept/drop/reject
// ends evaluation; continue rules may rewrite and fall through; jump
// evaluates another chain and resumes here when it falls off its end or
// returns. Falling off the end of the top-level chain accepts.

use std::net::Ipv4Addr;

use vrn_proto::{MacAddr, Packet};

use super::verdict::{DropReason, Transform};
use crate::model::{EntityId, Rewrite, RuleAction, RuleCondition};
use crate::store::TopologySnapshot;

/// Nested jumps allowed below the top-level chain.
pub const MAX_CHAIN_JUMPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerdict {
    Accept,
    Drop(DropReason),
}

/// Header values a rule condition can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PacketFields {
    in_port: Option<EntityId>,
    dl_src: MacAddr,
    dl_dst: MacAddr,
    ethertype: u16,
    nw_src: Option<Ipv4Addr>,
    nw_dst: Option<Ipv4Addr>,
    nw_proto: Option<u8>,
    tp_src: Option<u16>,
    tp_dst: Option<u16>,
}

impl PacketFields {
    /// ARP sender/target addresses stand in for IPv4 source/destination.
    fn of(packet: &Packet, in_port: Option<EntityId>) -> Self {
        let (nw_src, nw_dst, nw_proto, ports) = if let Some(ip) = packet.ipv4() {
            (Some(ip.src), Some(ip.dst), Some(ip.protocol()), ip.ports())
        } else if let Some(arp) = packet.arp() {
            (Some(arp.sender_ip), Some(arp.target_ip), None, None)
        } else {
            (None, None, None, None)
        };
        Self {
            in_port,
            dl_src: packet.eth_src,
            dl_dst: packet.eth_dst,
            ethertype: packet.ethertype(),
            nw_src,
            nw_dst,
            nw_proto,
            tp_src: ports.map(|(src, _)| src),
            tp_dst: ports.map(|(_, dst)| dst),
        }
    }
}

/// Apply a rewrite to the packet and record it in `transform`. Non-IPv4
/// packets are left alone.
pub(crate) fn apply_rewrite(rewrite: Rewrite, packet: &mut Packet, transform: &mut Transform) {
    let Some(ip) = packet.ipv4_mut() else {
        return;
    };
    match rewrite {
        Rewrite::NwSrc { addr } => {
            ip.src = addr;
            transform.nw_src = Some(addr);
        }
        Rewrite::NwDst { addr } => {
            ip.dst = addr;
            transform.nw_dst = Some(addr);
        }
    }
}

/// Evaluate `chain_id` against `packet`, applying continue-rule rewrites
/// to it as they match.
pub fn evaluate(
    snapshot: &TopologySnapshot,
    chain_id: EntityId,
    packet: &mut Packet,
    in_port: Option<EntityId>,
    transform: &mut Transform,
) -> ChainVerdict {
    let mut eval = Eval {
        snapshot,
        packet,
        in_port,
        transform,
    };
    match eval.run(chain_id, 0) {
        Flow::FellThrough => ChainVerdict::Accept,
        Flow::Terminal(verdict) => verdict,
    }
}

enum Flow {
    FellThrough,
    Terminal(ChainVerdict),
}

struct Eval<'a> {
    snapshot: &'a TopologySnapshot,
    packet: &'a mut Packet,
    in_port: Option<EntityId>,
    transform: &'a mut Transform,
}

impl Eval<'_> {
    fn run(&mut self, chain_id: EntityId, depth: usize) -> Flow {
        if depth > MAX_CHAIN_JUMPS {
            return Flow::Terminal(ChainVerdict::Drop(DropReason::LoopDetected));
        }
        if self.snapshot.chain(chain_id).is_none() {
            return Flow::Terminal(ChainVerdict::Drop(DropReason::TopologyMissing));
        }

        let snapshot = self.snapshot;
        for rule in snapshot.chain_rules(chain_id) {
            let fields = PacketFields::of(self.packet, self.in_port);
            if !condition_matches(&rule.condition, &fields, snapshot) {
                continue;
            }
            match &rule.action {
                RuleAction::Accept => return Flow::Terminal(ChainVerdict::Accept),
                RuleAction::Drop => {
                    return Flow::Terminal(ChainVerdict::Drop(DropReason::Filtered));
                }
                RuleAction::Reject => {
                    return Flow::Terminal(ChainVerdict::Drop(DropReason::Rejected));
                }
                RuleAction::Continue { rewrite } => {
                    if let Some(rewrite) = rewrite {
                        apply_rewrite(*rewrite, self.packet, self.transform);
                    }
                }
                RuleAction::Jump { chain_id: target } => {
                    if let Flow::Terminal(verdict) = self.run(*target, depth + 1) {
                        return Flow::Terminal(verdict);
                    }
                }
                RuleAction::Return => return Flow::FellThrough,
            }
        }
        Flow::FellThrough
    }
}

/// A set condition on an absent field never matches, inverted or not.
fn field<W, H>(want: Option<W>, inverted: bool, have: Option<H>, test: impl FnOnce(W, H) -> bool) -> bool {
    let Some(want) = want else {
        return true;
    };
    let Some(have) = have else {
        return false;
    };
    test(want, have) != inverted
}

fn condition_matches(cond: &RuleCondition, f: &PacketFields, snapshot: &TopologySnapshot) -> bool {
    let in_ports = (!cond.in_ports.is_empty()).then_some(&cond.in_ports);
    let in_group = |group: EntityId, addr: Ipv4Addr| {
        snapshot
            .ip_addr_group(group)
            .is_some_and(|g| g.contains(addr))
    };

    field(in_ports, cond.inv_in_ports, f.in_port, |ports, p| ports.contains(&p))
        && field(cond.dl_src, cond.inv_dl_src, Some(f.dl_src), |w, h| w == h)
        && field(cond.dl_dst, cond.inv_dl_dst, Some(f.dl_dst), |w, h| w == h)
        && field(cond.ethertype, cond.inv_ethertype, Some(f.ethertype), |w, h| w == h)
        && field(cond.nw_src, cond.inv_nw_src, f.nw_src, |net, a| net.contains(&a))
        && field(cond.nw_dst, cond.inv_nw_dst, f.nw_dst, |net, a| net.contains(&a))
        && field(
            cond.ip_addr_group_src,
            cond.inv_ip_addr_group_src,
            f.nw_src,
            in_group,
        )
        && field(
            cond.ip_addr_group_dst,
            cond.inv_ip_addr_group_dst,
            f.nw_dst,
            in_group,
        )
        && field(cond.nw_proto, cond.inv_nw_proto, f.nw_proto, |w, h| w == h)
        && field(cond.tp_src, cond.inv_tp_src, f.tp_src, |range, p| range.contains(p))
        && field(cond.tp_dst, cond.inv_tp_dst, f.tp_dst, |range, p| range.contains(p))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;

    use bytes::Bytes;
    use vrn_proto::{EthPayload, IpPayload, Ipv4Packet};

    use super::*;
    use crate::model::{Chain, IpAddrGroup, Rule, TopologyEntity};

    fn id(n: u128) -> EntityId {
        EntityId::from_u128(n)
    }

    fn ip_packet(src: [u8; 4], dst: [u8; 4]) -> Packet {
        Packet {
            eth_src: MacAddr::new([2, 0, 0, 0, 0, 1]),
            eth_dst: MacAddr::new([2, 0, 0, 0, 0, 2]),
            payload: EthPayload::Ipv4(Ipv4Packet {
                tos: 0,
                identification: 0,
                flags_fragment: 0,
                ttl: 64,
                src: Ipv4Addr::from(src),
                dst: Ipv4Addr::from(dst),
                options: Bytes::new(),
                payload: IpPayload::Other {
                    protocol: 253,
                    data: Bytes::new(),
                },
            }),
        }
    }

    fn chain(n: u128) -> TopologyEntity {
        TopologyEntity::Chain(Chain {
            id: id(n),
            name: String::new(),
        })
    }

    fn rule(n: u128, chain: u128, position: u32, condition: RuleCondition, action: RuleAction) -> TopologyEntity {
        TopologyEntity::Rule(Rule {
            id: id(n),
            chain_id: id(chain),
            position,
            condition,
            action,
        })
    }

    fn run(snapshot: &TopologySnapshot, chain: u128, packet: &mut Packet) -> ChainVerdict {
        evaluate(snapshot, id(chain), packet, None, &mut Transform::default())
    }

    #[test]
    fn empty_chain_accepts() {
        let snapshot = TopologySnapshot::from_entities([chain(1)]);
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(run(&snapshot, 1, &mut packet), ChainVerdict::Accept);
    }

    #[test]
    fn missing_chain_drops() {
        let snapshot = TopologySnapshot::default();
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(
            run(&snapshot, 1, &mut packet),
            ChainVerdict::Drop(DropReason::TopologyMissing)
        );
    }

    #[test]
    fn first_terminating_match_by_position_wins() {
        // Ids are in the opposite order of positions.
        let snapshot = TopologySnapshot::from_entities([
            chain(1),
            rule(10, 1, 3, RuleCondition::default(), RuleAction::Accept),
            rule(11, 1, 2, RuleCondition::default(), RuleAction::Drop),
            rule(12, 1, 1, RuleCondition::default(), RuleAction::Continue { rewrite: None }),
        ]);
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(
            run(&snapshot, 1, &mut packet),
            ChainVerdict::Drop(DropReason::Filtered)
        );
    }

    #[test]
    fn inverted_group_match_excludes_members() {
        let group = TopologyEntity::IpAddrGroup(IpAddrGroup {
            id: id(50),
            name: "A".into(),
            version: 0,
            members: BTreeSet::from(["10.0.0.0/24".parse().unwrap()]),
        });
        let snapshot = TopologySnapshot::from_entities([
            chain(1),
            group,
            rule(
                10,
                1,
                1,
                RuleCondition {
                    ip_addr_group_src: Some(id(50)),
                    inv_ip_addr_group_src: true,
                    ..RuleCondition::default()
                },
                RuleAction::Drop,
            ),
        ]);

        let mut member = ip_packet([10, 0, 0, 5], [10, 0, 1, 1]);
        assert_eq!(run(&snapshot, 1, &mut member), ChainVerdict::Accept);

        let mut outsider = ip_packet([192, 168, 1, 1], [10, 0, 1, 1]);
        assert_eq!(
            run(&snapshot, 1, &mut outsider),
            ChainVerdict::Drop(DropReason::Filtered)
        );
    }

    #[test]
    fn jump_returns_to_caller() {
        let snapshot = TopologySnapshot::from_entities([
            chain(1),
            chain(2),
            rule(10, 1, 1, RuleCondition::default(), RuleAction::Jump { chain_id: id(2) }),
            rule(11, 1, 2, RuleCondition::default(), RuleAction::Reject),
            rule(20, 2, 1, RuleCondition::default(), RuleAction::Return),
            rule(21, 2, 2, RuleCondition::default(), RuleAction::Accept),
        ]);
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(
            run(&snapshot, 1, &mut packet),
            ChainVerdict::Drop(DropReason::Rejected)
        );
    }

    #[test]
    fn self_jump_is_a_loop() {
        let snapshot = TopologySnapshot::from_entities([
            chain(1),
            rule(10, 1, 1, RuleCondition::default(), RuleAction::Jump { chain_id: id(1) }),
        ]);
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(
            run(&snapshot, 1, &mut packet),
            ChainVerdict::Drop(DropReason::LoopDetected)
        );
    }

    #[test]
    fn continue_rewrite_is_visible_to_later_rules() {
        let snapshot = TopologySnapshot::from_entities([
            chain(1),
            rule(
                10,
                1,
                1,
                RuleCondition::default(),
                RuleAction::Continue {
                    rewrite: Some(Rewrite::NwDst {
                        addr: Ipv4Addr::new(172, 16, 0, 9),
                    }),
                },
            ),
            rule(
                11,
                1,
                2,
                RuleCondition {
                    nw_dst: Some("172.16.0.0/16".parse().unwrap()),
                    ..RuleCondition::default()
                },
                RuleAction::Drop,
            ),
        ]);
        let mut packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        let mut transform = Transform::default();
        let verdict = evaluate(&snapshot, id(1), &mut packet, None, &mut transform);
        assert_eq!(verdict, ChainVerdict::Drop(DropReason::Filtered));
        assert_eq!(transform.nw_dst, Some(Ipv4Addr::new(172, 16, 0, 9)));
    }
}
