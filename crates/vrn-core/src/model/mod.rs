// ── Topology model ──
//
// Value snapshots of the objects stored in the topology directory. The
// core never mutates them; a watch notification replaces the cached copy.

mod device;
mod entity_id;
mod policy;
mod port;
mod tunnel;

pub use device::{Bridge, NextHop, Route, Router};
pub use entity_id::EntityId;
pub use policy::{Chain, IpAddrGroup, PortRange, Rewrite, Rule, RuleAction, RuleCondition};
pub use port::{Port, PortBinding, RouterPortAddress};
pub use tunnel::{HostConfig, TunnelZone};

use serde::{Deserialize, Serialize};

/// Closed set of stored object types. The serialized name doubles as the
/// directory segment holding that type's nodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    #[strum(serialize = "bridges")]
    Bridge,
    #[strum(serialize = "routers")]
    Router,
    #[strum(serialize = "ports")]
    Port,
    #[strum(serialize = "chains")]
    Chain,
    #[strum(serialize = "rules")]
    Rule,
    #[strum(serialize = "ip_addr_groups")]
    IpAddrGroup,
    #[strum(serialize = "tunnel_zones")]
    TunnelZone,
}

impl EntityKind {
    /// Directory segment for this kind, e.g. `ports`.
    pub fn segment(self) -> &'static str {
        self.into()
    }
}

/// One stored object of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEntity {
    Bridge(Bridge),
    Router(Router),
    Port(Port),
    Chain(Chain),
    Rule(Rule),
    IpAddrGroup(IpAddrGroup),
    TunnelZone(TunnelZone),
}

impl TopologyEntity {
    pub fn id(&self) -> EntityId {
        match self {
            Self::Bridge(e) => e.id,
            Self::Router(e) => e.id,
            Self::Port(e) => e.id,
            Self::Chain(e) => e.id,
            Self::Rule(e) => e.id,
            Self::IpAddrGroup(e) => e.id,
            Self::TunnelZone(e) => e.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Bridge(_) => EntityKind::Bridge,
            Self::Router(_) => EntityKind::Router,
            Self::Port(_) => EntityKind::Port,
            Self::Chain(_) => EntityKind::Chain,
            Self::Rule(_) => EntityKind::Rule,
            Self::IpAddrGroup(_) => EntityKind::IpAddrGroup,
            Self::TunnelZone(_) => EntityKind::TunnelZone,
        }
    }

    /// Typed view of the record, `None` when the kind differs.
    pub fn data<T: Entity>(&self) -> Option<&T> {
        T::view(self)
    }

    /// Decode a stored node of the given kind.
    pub fn decode(kind: EntityKind, data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Bridge => Self::Bridge(serde_json::from_slice(data)?),
            EntityKind::Router => Self::Router(serde_json::from_slice(data)?),
            EntityKind::Port => Self::Port(serde_json::from_slice(data)?),
            EntityKind::Chain => Self::Chain(serde_json::from_slice(data)?),
            EntityKind::Rule => Self::Rule(serde_json::from_slice(data)?),
            EntityKind::IpAddrGroup => Self::IpAddrGroup(serde_json::from_slice(data)?),
            EntityKind::TunnelZone => Self::TunnelZone(serde_json::from_slice(data)?),
        })
    }

    /// Encode the record as stored in its node.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Bridge(e) => serde_json::to_vec(e),
            Self::Router(e) => serde_json::to_vec(e),
            Self::Port(e) => serde_json::to_vec(e),
            Self::Chain(e) => serde_json::to_vec(e),
            Self::Rule(e) => serde_json::to_vec(e),
            Self::IpAddrGroup(e) => serde_json::to_vec(e),
            Self::TunnelZone(e) => serde_json::to_vec(e),
        }
    }
}

/// Capability shared by every record type: its id and a typed accessor
/// through [`TopologyEntity`].
pub trait Entity: Sized {
    const KIND: EntityKind;

    fn id(&self) -> EntityId;

    fn view(entity: &TopologyEntity) -> Option<&Self>;

    fn into_entity(self) -> TopologyEntity;
}

macro_rules! impl_entity {
    ($ty:ident) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$ty;

            fn id(&self) -> EntityId {
                self.id
            }

            fn view(entity: &TopologyEntity) -> Option<&Self> {
                match entity {
                    TopologyEntity::$ty(e) => Some(e),
                    _ => None,
                }
            }

            fn into_entity(self) -> TopologyEntity {
                TopologyEntity::$ty(self)
            }
        }

        impl From<$ty> for TopologyEntity {
            fn from(e: $ty) -> Self {
                TopologyEntity::$ty(e)
            }
        }
    };
}

impl_entity!(Bridge);
impl_entity!(Router);
impl_entity!(Port);
impl_entity!(Chain);
impl_entity!(Rule);
impl_entity!(IpAddrGroup);
impl_entity!(TunnelZone);
