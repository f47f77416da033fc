use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ipset::{ip_to_u128, usable_bounds};

/// Reverse DNS mode for a subnet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RdnsMode {
    #[default]
    Default,
    Enabled,
    Disabled,
}

/// Address family of a subnet, range or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// A network known to the address-space registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: u64,
    pub name: String,
    pub cidr: IpNet,
    pub gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    /// Whether DHCP on this subnet is run by MAAS
    pub managed: bool,
    pub allow_dns: bool,
    pub allow_proxy: bool,
    #[serde(default)]
    pub rdns_mode: RdnsMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subnet {
    pub fn family(&self) -> Family {
        Family::of_net(&self.cidr)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.cidr.contains(ip)
    }

    /// Inside the CIDR and not a network, broadcast or subnet-router
    /// anycast address.
    pub fn is_usable_host(&self, ip: &IpAddr) -> bool {
        if !self.contains(ip) {
            return false;
        }
        let (first, last) = usable_bounds(&self.cidr);
        (first..=last).contains(&ip_to_u128(*ip))
    }

    /// Gateway must sit inside the CIDR. IPv6 subnets may also use a
    /// link-local gateway.
    pub fn validate_gateway(&self) -> Result<()> {
        let Some(gateway) = self.gateway_ip else {
            return Ok(());
        };
        if self.contains(&gateway) {
            return Ok(());
        }
        if let IpAddr::V6(v6) = gateway {
            if self.family() == Family::V6 && is_link_local_v6(u128::from(v6)) {
                return Ok(());
            }
        }
        Err(Error::InvalidSubnet(format!(
            "gateway IP {gateway} must be within CIDR range {}",
            self.cidr
        )))
    }
}

/// fe80::/64
fn is_link_local_v6(addr: u128) -> bool {
    addr >> 64 == 0xfe80_0000_0000_0000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpRangeType {
    Dynamic,
    Reserved,
}

impl std::fmt::Display for IpRangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpRangeType::Dynamic => write!(f, "dynamic"),
            IpRangeType::Reserved => write!(f, "reserved"),
        }
    }
}

/// An administratively defined address interval on a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub id: u64,
    pub subnet_id: u64,
    pub start_ip: IpAddr,
    pub end_ip: IpAddr,
    #[serde(rename = "type")]
    pub range_type: IpRangeType,
    pub user: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpRange {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        Family::of(ip) == Family::of(&self.start_ip) && *ip >= self.start_ip && *ip <= self.end_ip
    }
}

/// Why an address was claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocType {
    Auto,
    Sticky,
    UserReserved,
    Dhcp,
    Discovered,
}

impl AllocType {
    /// Alloc types that are mutually exclusive claims on an address.
    pub fn is_static_family(&self) -> bool {
        !matches!(self, AllocType::Discovered)
    }

    /// Alloc types accepted by the allocator entry point.
    pub fn is_allocatable(&self) -> bool {
        matches!(
            self,
            AllocType::Auto | AllocType::Sticky | AllocType::UserReserved
        )
    }
}

impl std::fmt::Display for AllocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocType::Auto => write!(f, "AUTO"),
            AllocType::Sticky => write!(f, "STICKY"),
            AllocType::UserReserved => write!(f, "USER_RESERVED"),
            AllocType::Dhcp => write!(f, "DHCP"),
            AllocType::Discovered => write!(f, "DISCOVERED"),
        }
    }
}

impl std::str::FromStr for AllocType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AUTO" => Ok(AllocType::Auto),
            "STICKY" => Ok(AllocType::Sticky),
            "USER_RESERVED" => Ok(AllocType::UserReserved),
            "DHCP" => Ok(AllocType::Dhcp),
            "DISCOVERED" => Ok(AllocType::Discovered),
            _ => Err(Error::InvalidAllocationType(format!(
                "unknown alloc type: {s}"
            ))),
        }
    }
}

/// Lifecycle state of a static IP row, derived from `ip` and
/// `temp_expires_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    Unassigned,
    Assigned,
    Provisional,
}

/// One allocation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIpAddress {
    pub id: u64,
    /// None while the row is a placeholder (e.g. waiting for DHCP)
    pub ip: Option<IpAddr>,
    pub alloc_type: AllocType,
    pub subnet_id: Option<u64>,
    pub user: Option<String>,
    pub temp_expires_on: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StaticIpAddress {
    pub fn state(&self) -> AddressState {
        match (self.ip, self.temp_expires_on) {
            (None, _) => AddressState::Unassigned,
            (Some(_), None) => AddressState::Assigned,
            (Some(_), Some(_)) => AddressState::Provisional,
        }
    }

    /// Address held in the static-family uniqueness index, if any.
    pub fn static_claim(&self) -> Option<IpAddr> {
        self.ip.filter(|_| self.alloc_type.is_static_family())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.temp_expires_on.is_some_and(|t| t <= now)
    }
}

/// Static route whose gateway occupies an address on its source subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub id: u64,
    pub source_subnet_id: u64,
    pub destination_subnet_id: u64,
    pub gateway_ip: IpAddr,
    pub metric: u32,
    pub created_at: DateTime<Utc>,
}

/// An address seen on the wire by passive network discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbour {
    pub ip: IpAddr,
    pub mac_address: Option<String>,
    pub subnet_id: Option<u64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Error,
    Warning,
    Success,
    Info,
}

/// Singleton advisory record keyed by `ident`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub ident: String,
    pub category: NotificationCategory,
    pub message: String,
    pub subnet_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Notification ident of the exhaustion warning for a subnet.
pub fn exhaustion_ident(subnet_id: u64) -> String {
    format!("ip_exhaustion__subnet_{subnet_id}")
}
