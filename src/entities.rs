use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::errors::{AgentError, Result};

pub const INTERFACE_PREFIX: &str = "multinic";
pub const MAX_INTERFACES: usize = 10;

/// Canonical lowercase colon-separated EUI-48 MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(AgentError::validation_with_code(
                "VAL004",
                "MAC address cannot be empty",
            ));
        }
        let mut bytes = Vec::with_capacity(6);
        for part in value.split(|c| c == ':' || c == '-') {
            if part.len() != 2 {
                bytes.clear();
                break;
            }
            match u8::from_str_radix(part, 16) {
                Ok(b) => bytes.push(b),
                Err(_) => {
                    bytes.clear();
                    break;
                }
            }
        }
        if bytes.len() != 6 {
            return Err(AgentError::validation_with_code(
                "VAL005",
                format!("invalid MAC address format: {}", value),
            ));
        }
        let canonical = bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw MAC string.
    pub fn matches(&self, other: &str) -> bool {
        other.trim().eq_ignore_ascii_case(&self.0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// DNS-1123 label or subdomain, at most 253 characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(AgentError::validation_with_code(
                "VAL012",
                "node name cannot be empty",
            ));
        }
        if value.len() > 253 {
            return Err(AgentError::validation_with_code(
                "VAL013",
                format!("node name too long: {} characters (maximum: 253)", value.len()),
            ));
        }
        let valid = value.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
        if !valid {
            return Err(AgentError::validation_with_code(
                "VAL014",
                format!("invalid node name format: {}", value),
            ));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv4 network in CIDR notation. Keeps the value as given and the
/// normalized network address for comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    value: String,
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(AgentError::validation_with_code("VAL006", "CIDR cannot be empty"));
        }
        let invalid =
            || AgentError::validation_with_code("VAL007", format!("invalid CIDR format: {}", value));
        let (addr_part, prefix_part) = value.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr_part.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix_part.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let mask = prefix_mask(prefix);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        Ok(Self {
            value: value.to_string(),
            network,
            prefix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Normalized "network/prefix" form, e.g. "10.0.0.0/24".
    pub fn network_string(&self) -> String {
        format!("{}/{}", self.network, self.prefix)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == u32::from(self.network)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mtu(u32);

impl Mtu {
    pub fn new(value: u32) -> Result<Self> {
        if value < 68 {
            return Err(AgentError::validation_with_code(
                "VAL008",
                format!("MTU too small: {} (minimum: 68)", value),
            ));
        }
        if value > 65536 {
            return Err(AgentError::validation_with_code(
                "VAL009",
                format!("MTU too large: {} (maximum: 65536)", value),
            ));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_jumbo_frame(self) -> bool {
        self.0 > 1500
    }
}

/// Logical name from the fixed pool, "multinic0" through "multinic9".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName {
    value: String,
    index: usize,
}

impl InterfaceName {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(AgentError::validation_with_code(
                "VAL016",
                "interface name cannot be empty",
            ));
        }
        let index = name
            .strip_prefix(INTERFACE_PREFIX)
            .and_then(|rest| rest.parse::<usize>().ok())
            .ok_or_else(|| {
                AgentError::validation_with_code(
                    "VAL017",
                    format!(
                        "invalid interface name format: {} (expected: {}<number>)",
                        name, INTERFACE_PREFIX
                    ),
                )
            })?;
        if index >= MAX_INTERFACES {
            return Err(AgentError::validation_with_code(
                "VAL019",
                format!("interface index out of range: {} (0-{})", index, MAX_INTERFACES - 1),
            ));
        }
        Ok(Self {
            value: name.to_string(),
            index,
        })
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::new(&format!("{}{}", INTERFACE_PREFIX, index))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Pending,
    Configured,
    Failed,
}

impl InterfaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceStatus::Pending => "Pending",
            InterfaceStatus::Configured => "Configured",
            InterfaceStatus::Failed => "Failed",
        }
    }
}

/// Desired state for one NIC on one node. Immutable after construction
/// apart from the status transitions.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    id: u32,
    mac: MacAddress,
    node_name: NodeName,
    ip: Ipv4Addr,
    cidr: Cidr,
    mtu: Mtu,
    status: InterfaceStatus,
}

impl NetworkInterface {
    pub fn new(
        id: u32,
        mac: &str,
        node_name: &str,
        ip: &str,
        cidr: &str,
        mtu: u32,
    ) -> Result<Self> {
        let mac = MacAddress::new(mac)?;
        let node_name = NodeName::new(node_name)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| {
            AgentError::validation_with_code("VAL003", format!("invalid IP address format: {}", ip))
        })?;
        let cidr = Cidr::new(cidr)?;
        let mtu = Mtu::new(mtu)?;

        if !cidr.contains(ip) {
            return Err(AgentError::validation_with_code(
                "VAL015",
                format!("IP address {} is not within CIDR {}", ip, cidr),
            ));
        }

        Ok(Self {
            id,
            mac,
            node_name,
            ip,
            cidr,
            mtu,
            status: InterfaceStatus::Pending,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    pub fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn cidr(&self) -> &Cidr {
        &self.cidr
    }

    pub fn mtu(&self) -> Mtu {
        self.mtu
    }

    pub fn status(&self) -> InterfaceStatus {
        self.status
    }

    pub fn mark_configured(&mut self) {
        self.status = InterfaceStatus::Configured;
    }

    pub fn mark_failed(&mut self) {
        self.status = InterfaceStatus::Failed;
    }

    pub fn can_apply_to(&self, node: &str) -> bool {
        self.node_name.as_str() == node
    }

    /// Revalidates the construction invariants. Cheap and called once
    /// more right before an apply.
    pub fn validate(&self) -> Result<()> {
        if !self.cidr.contains(self.ip) {
            return Err(AgentError::validation_with_code(
                "VAL015",
                format!("IP address {} is not within CIDR {}", self.ip, self.cidr),
            ));
        }
        Ok(())
    }
}

/// One failed interface in the run summary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InterfaceFailure {
    pub id: u32,
    pub mac: String,
    pub name: String,
    #[serde(rename = "errorType")]
    pub error_type: String,
    pub reason: String,
}

/// One processed interface in the run summary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InterfaceResult {
    pub id: u32,
    pub mac: String,
    pub name: String,
    pub status: String,
}
