//! Interface enumeration and a continuous path monitor standing in for
//! the OS path-monitor callback: polls `if-addrs` on an interval, tracks
//! VPN activity, and clears sticky bindings on a VPN state transition.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const VPN_PREFIXES: &[&str] = &["utun", "ipsec", "ppp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Wifi,
    Cellular,
    Wired,
    Vpn,
    Loopback,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub interface_type: InterfaceType,
    pub addresses: Vec<IpAddr>,
    pub up: bool,
}

#[derive(Debug, Clone)]
pub struct InterfaceBinding {
    pub interface_name: String,
    pub interface_index: u32,
    pub interface_type: InterfaceType,
    pub resolver_endpoint: String,
    pub binding_time: DateTime<Utc>,
    pub transaction_id: u16,
}

fn classify(name: &str) -> InterfaceType {
    if name == "lo" || name == "lo0" {
        InterfaceType::Loopback
    } else if VPN_PREFIXES.iter().any(|p| name.starts_with(p)) {
        InterfaceType::Vpn
    } else if name.starts_with("en") || name.starts_with("eth") {
        InterfaceType::Wired
    } else if name.starts_with("wl") || name.starts_with("wlan") {
        InterfaceType::Wifi
    } else if name.starts_with("pdp") || name.starts_with("rmnet") {
        InterfaceType::Cellular
    } else {
        InterfaceType::Unknown
    }
}

/// Snapshot of the host's network interfaces via `if-addrs`, annotated
/// with the coarse classification the binder strategies key off of.
pub fn enumerate_interfaces() -> Vec<InterfaceInfo> {
    let Ok(raw) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    let mut by_name: std::collections::HashMap<String, InterfaceInfo> = std::collections::HashMap::new();
    for iface in raw {
        let entry = by_name.entry(iface.name.clone()).or_insert_with(|| InterfaceInfo {
            name: iface.name.clone(),
            index: 0,
            interface_type: classify(&iface.name),
            addresses: Vec::new(),
            up: !iface.is_loopback() || iface.name == "lo" || iface.name == "lo0",
        });
        entry.addresses.push(iface.ip());
    }
    by_name.into_values().collect()
}

/// Whether a resolved interface is a valid egress candidate: it must
/// exist, report as up, and this implementation treats "exists in the
/// current enumeration" as satisfying "running".
pub fn is_satisfied(interfaces: &[InterfaceInfo], name: &str) -> bool {
    interfaces.iter().any(|i| i.name == name && i.up)
}

pub fn default_interface(interfaces: &[InterfaceInfo]) -> Option<&InterfaceInfo> {
    interfaces
        .iter()
        .find(|i| i.name == "en0")
        .or_else(|| interfaces.iter().find(|i| i.name.starts_with("en") && i.up))
}

pub fn first_active_vpn_interface(interfaces: &[InterfaceInfo]) -> Option<&InterfaceInfo> {
    interfaces.iter().find(|i| i.interface_type == InterfaceType::Vpn && i.up)
}

pub struct PathMonitor {
    pub vpn_active: Arc<AtomicBool>,
    sticky: Arc<DashMap<u16, InterfaceBinding>>,
}

impl PathMonitor {
    pub fn spawn(sticky: Arc<DashMap<u16, InterfaceBinding>>) -> Self {
        let vpn_active = Arc::new(AtomicBool::new(false));
        let monitor = Self {
            vpn_active: vpn_active.clone(),
            sticky: sticky.clone(),
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let interfaces = enumerate_interfaces();
                let now_active = first_active_vpn_interface(&interfaces).is_some();
                let was_active = vpn_active.swap(now_active, Ordering::SeqCst);
                if now_active != was_active {
                    info!(vpn_active = now_active, "VPN state transition, clearing sticky interface bindings");
                    sticky.clear();
                }
            }
        });
        monitor
    }

    pub fn is_vpn_active(&self) -> bool {
        self.vpn_active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_interface_name_prefixes() {
        assert_eq!(classify("en0"), InterfaceType::Wired);
        assert_eq!(classify("utun3"), InterfaceType::Vpn);
        assert_eq!(classify("lo0"), InterfaceType::Loopback);
        assert_eq!(classify("wlan0"), InterfaceType::Wifi);
        assert_eq!(classify("rmnet0"), InterfaceType::Cellular);
        assert_eq!(classify("mystery0"), InterfaceType::Unknown);
    }

    #[test]
    fn default_interface_prefers_en0() {
        let interfaces = vec![
            InterfaceInfo {
                name: "en1".into(),
                index: 2,
                interface_type: InterfaceType::Wired,
                addresses: vec![],
                up: true,
            },
            InterfaceInfo {
                name: "en0".into(),
                index: 1,
                interface_type: InterfaceType::Wired,
                addresses: vec![],
                up: true,
            },
        ];
        assert_eq!(default_interface(&interfaces).unwrap().name, "en0");
    }

    #[test]
    fn is_satisfied_requires_presence_and_up_flag() {
        let interfaces = vec![InterfaceInfo {
            name: "en0".into(),
            index: 1,
            interface_type: InterfaceType::Wired,
            addresses: vec![],
            up: false,
        }];
        assert!(!is_satisfied(&interfaces, "en0"));
        assert!(!is_satisfied(&interfaces, "en9"));
    }
}
