//! Interface binder: picks the egress interface for an upstream query,
//! and the retry controller for upstream transport failures.

pub mod cidr;
pub mod reachability;
pub mod retry;

use crate::error::CoreError;
use cidr::Cidr;
use dashmap::DashMap;
use reachability::{InterfaceBinding, InterfaceType, PathMonitor, default_interface, enumerate_interfaces, first_active_vpn_interface, is_satisfied};
use std::net::IpAddr;
use std::sync::Arc;

pub use retry::{RetryAttempt, RetryController, RetryDecision, RetryReason};

#[derive(Debug, Clone)]
pub enum BindingStrategy {
    ResolverCidr { vpn_cidrs: Vec<String> },
    OriginalPath,
    ActiveResolver,
}

impl Default for BindingStrategy {
    fn default() -> Self {
        BindingStrategy::ResolverCidr {
            vpn_cidrs: vec!["100.64.0.0/10".to_string()],
        }
    }
}

/// Per-flow context threaded into the binder so `original_path` can
/// honor the interface a client's query actually arrived on.
#[derive(Debug, Clone, Default)]
pub struct FlowMetadata {
    pub originating_interface: Option<String>,
}

pub struct InterfaceBinder {
    strategy: BindingStrategy,
    sticky: Arc<DashMap<u16, InterfaceBinding>>,
    sticky_enabled: bool,
    monitor: PathMonitor,
}

impl InterfaceBinder {
    pub fn new(strategy: BindingStrategy, sticky_enabled: bool) -> Self {
        let sticky = Arc::new(DashMap::new());
        let monitor = PathMonitor::spawn(sticky.clone());
        Self {
            strategy,
            sticky,
            sticky_enabled,
            monitor,
        }
    }

    pub fn bind(
        &self,
        transaction_id: u16,
        resolver_ip: IpAddr,
        resolver_endpoint: &str,
        flow: &FlowMetadata,
    ) -> Result<InterfaceBinding, CoreError> {
        if self.sticky_enabled {
            if let Some(existing) = self.sticky.get(&transaction_id) {
                return Ok(existing.clone());
            }
        }

        let interfaces = enumerate_interfaces();
        let chosen = match &self.strategy {
            BindingStrategy::ResolverCidr { vpn_cidrs } => {
                let in_vpn_range = vpn_cidrs
                    .iter()
                    .filter_map(|c| Cidr::parse(c))
                    .any(|cidr| cidr.contains(resolver_ip));
                if in_vpn_range && self.monitor.is_vpn_active() {
                    first_active_vpn_interface(&interfaces).or_else(|| default_interface(&interfaces))
                } else {
                    default_interface(&interfaces)
                }
            }
            BindingStrategy::OriginalPath => {
                if let Some(name) = &flow.originating_interface {
                    interfaces
                        .iter()
                        .find(|i| &i.name == name)
                        .or_else(|| default_interface(&interfaces))
                } else {
                    default_interface(&interfaces)
                }
            }
            // Simplified to "default interface"; true reachability-based
            // selection needs OS routing-table introspection this source
            // deliberately leaves unresolved.
            BindingStrategy::ActiveResolver => default_interface(&interfaces),
        };

        let chosen = chosen.ok_or(CoreError::InterfaceUnavailable)?;
        if !is_satisfied(&interfaces, &chosen.name) {
            return Err(CoreError::InterfaceUnavailable);
        }

        let binding = InterfaceBinding {
            interface_name: chosen.name.clone(),
            interface_index: chosen.index,
            interface_type: chosen.interface_type,
            resolver_endpoint: resolver_endpoint.to_string(),
            binding_time: chrono::Utc::now(),
            transaction_id,
        };

        if self.sticky_enabled {
            self.sticky.insert(transaction_id, binding.clone());
        }
        Ok(binding)
    }

    pub fn clear_transaction(&self, transaction_id: u16) {
        self.sticky.remove(&transaction_id);
    }

    pub fn is_vpn_active(&self) -> bool {
        self.monitor.is_vpn_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_cidr_strategy_falls_back_without_vpn() {
        let binder = InterfaceBinder::new(BindingStrategy::default(), true);
        let result = binder.bind(42, "8.8.8.8".parse().unwrap(), "8.8.8.8:53", &FlowMetadata::default());
        // No real network interfaces are guaranteed in a test sandbox; we
        // only assert the call doesn't panic and reports unavailability
        // consistently rather than crashing the proxy loop.
        match result {
            Ok(binding) => assert_eq!(binding.transaction_id, 42),
            Err(CoreError::InterfaceUnavailable) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sticky_binding_clears_on_demand() {
        let binder = InterfaceBinder::new(BindingStrategy::default(), true);
        binder.clear_transaction(42);
        assert!(binder.sticky.get(&42).is_none());
    }
}
