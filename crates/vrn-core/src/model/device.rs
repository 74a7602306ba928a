// ── Virtual devices ──
//
// Bridges and routers. Ports point at their device, not the other way
// around; the snapshot indexes ports per device.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    /// Static routes. Port services may contribute more at simulation time.
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Where a matching route sends the packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextHop {
    /// Out of one of the router's ports. Without a gateway the destination
    /// itself is the next hop (directly connected network).
    Port {
        port_id: EntityId,
        #[serde(default)]
        gateway: Option<Ipv4Addr>,
    },
    Blackhole,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: Ipv4Net,
    /// Source restriction; `0.0.0.0/0` matches everything.
    #[serde(default)]
    pub src: Ipv4Net,
    pub next_hop: NextHop,
    /// Lower wins between routes of equal prefix length.
    #[serde(default)]
    pub weight: u32,
}

impl Route {
    pub fn via_port(dst: Ipv4Net, port_id: EntityId, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            dst,
            src: Ipv4Net::default(),
            next_hop: NextHop::Port { port_id, gateway },
            weight: 0,
        }
    }

    pub fn matches(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        self.dst.contains(&dst) && self.src.contains(&src)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn route_defaults_to_any_source() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "dst": "10.0.0.0/24",
            "next_hop": { "type": "blackhole" }
        }))
        .unwrap();
        assert_eq!(route.src, "0.0.0.0/0".parse::<Ipv4Net>().unwrap());
        assert!(route.matches(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(10, 0, 0, 9)));
        assert!(!route.matches(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(10, 0, 1, 9)));
    }
}
