//! Address families and hook points.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol family a table, chain or extension belongs to.
///
/// `Unspec` on an extension means "usable from any family".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Family-agnostic.
    #[default]
    Unspec,
    /// Dual-stack IPv4/IPv6.
    Inet,
    Ipv4,
    Ipv6,
    Arp,
    Bridge,
    /// Per-device ingress.
    Netdev,
}

impl Family {
    /// Returns true for the family-agnostic wildcard.
    pub fn is_unspec(&self) -> bool {
        matches!(self, Family::Unspec)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspec => write!(f, "unspec"),
            Self::Inet => write!(f, "inet"),
            Self::Ipv4 => write!(f, "ip"),
            Self::Ipv6 => write!(f, "ip6"),
            Self::Arp => write!(f, "arp"),
            Self::Bridge => write!(f, "bridge"),
            Self::Netdev => write!(f, "netdev"),
        }
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unspec" => Ok(Self::Unspec),
            "inet" => Ok(Self::Inet),
            "ip" | "ipv4" => Ok(Self::Ipv4),
            "ip6" | "ipv6" => Ok(Self::Ipv6),
            "arp" => Ok(Self::Arp),
            "bridge" => Ok(Self::Bridge),
            "netdev" => Ok(Self::Netdev),
            _ => Err(format!("Unknown family: {}", s)),
        }
    }
}

/// Hook point a base chain or flowtable attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookNum {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
    /// Netdev ingress; the only hook flowtables use.
    Ingress,
}

impl HookNum {
    /// Bit of this hook in a chain type's hook mask.
    pub fn mask(&self) -> u32 {
        1 << (*self as u32)
    }

    /// Mask with every hook point set.
    pub const ALL: u32 = 0x3f;
}

impl fmt::Display for HookNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prerouting => write!(f, "prerouting"),
            Self::Input => write!(f, "input"),
            Self::Forward => write!(f, "forward"),
            Self::Output => write!(f, "output"),
            Self::Postrouting => write!(f, "postrouting"),
            Self::Ingress => write!(f, "ingress"),
        }
    }
}

impl FromStr for HookNum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prerouting" => Ok(Self::Prerouting),
            "input" => Ok(Self::Input),
            "forward" => Ok(Self::Forward),
            "output" => Ok(Self::Output),
            "postrouting" => Ok(Self::Postrouting),
            "ingress" => Ok(Self::Ingress),
            _ => Err(format!("Unknown hook: {}", s)),
        }
    }
}
