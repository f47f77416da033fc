use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Change notifications emitted after IPAM mutations commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A subnet was created, updated, or deleted
    SubnetChanged {
        instance_id: String,
        subnet_id: u64,
        cidr: String,
        action: ChangeAction,
        timestamp: DateTime<Utc>,
    },

    /// A dynamic or reserved range was created, updated, or deleted
    IpRangeChanged {
        instance_id: String,
        subnet_id: u64,
        iprange_id: u64,
        start_ip: String,
        end_ip: String,
        action: ChangeAction,
        timestamp: DateTime<Utc>,
    },

    /// A static IP row changed. `subnet_ids` lists every subnet whose
    /// occupancy moved (old and new when the row changed subnet).
    StaticIpChanged {
        instance_id: String,
        subnet_ids: Vec<u64>,
        address_id: u64,
        ip: Option<String>,
        action: ChangeAction,
        timestamp: DateTime<Utc>,
    },

    /// The exhaustion warning of a subnet was raised or cleared
    ExhaustionChanged {
        instance_id: String,
        subnet_id: u64,
        ident: String,
        raised: bool,
        free: u64,
        threshold: u32,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl Event {
    pub fn instance_id(&self) -> &str {
        match self {
            Event::SubnetChanged { instance_id, .. } => instance_id,
            Event::IpRangeChanged { instance_id, .. } => instance_id,
            Event::StaticIpChanged { instance_id, .. } => instance_id,
            Event::ExhaustionChanged { instance_id, .. } => instance_id,
        }
    }

    pub fn topic_suffix(&self) -> &str {
        match self {
            Event::SubnetChanged { .. } => "subnets",
            Event::IpRangeChanged { .. } => "ipranges",
            Event::StaticIpChanged { .. } => "staticips",
            Event::ExhaustionChanged { .. } => "notifications",
        }
    }

    /// Subnets affected by this event.
    pub fn subnet_ids(&self) -> Vec<u64> {
        match self {
            Event::SubnetChanged { subnet_id, .. }
            | Event::IpRangeChanged { subnet_id, .. }
            | Event::ExhaustionChanged { subnet_id, .. } => vec![*subnet_id],
            Event::StaticIpChanged { subnet_ids, .. } => subnet_ids.clone(),
        }
    }
}
