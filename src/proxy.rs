//! Proxy engine (C9): glues the wire codec, rule store, interface binder
//! and retry controller into the per-datagram request flow.

use crate::binder::reachability::InterfaceType;
use crate::binder::{FlowMetadata, InterfaceBinder, RetryController, RetryDecision, RetryReason};
use crate::dns::{self, Query};
use crate::error::CoreError;
use crate::rules::{RuleAction, RuleStore, WildcardRootPolicy};
use crate::telemetry::{TelemetryEvent, TelemetryEventType, TelemetryHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream_resolver: SocketAddr,
    pub ttl_ceiling: Option<u32>,
    pub upstream_timeout: Duration,
    pub wildcard_root_policy: WildcardRootPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_resolver: "8.8.8.8:53".parse().unwrap(),
            ttl_ceiling: None,
            upstream_timeout: Duration::from_secs(3),
            wildcard_root_policy: WildcardRootPolicy::default(),
        }
    }
}

pub struct ProxyEngine {
    config: ProxyConfig,
    rules: Arc<RuleStore>,
    binder: Arc<InterfaceBinder>,
    retry: Arc<RetryController>,
    telemetry: Option<TelemetryHandle>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        rules: Arc<RuleStore>,
        binder: Arc<InterfaceBinder>,
        retry: Arc<RetryController>,
        telemetry: Option<TelemetryHandle>,
    ) -> Self {
        Self {
            config,
            rules,
            binder,
            retry,
            telemetry,
        }
    }

    /// Handles one inbound datagram end to end, returning the bytes to
    /// reply with.
    pub async fn handle_datagram(&self, flow: &FlowMetadata, datagram: &[u8]) -> Vec<u8> {
        let query = match dns::parse_query(datagram) {
            Ok(query) => query,
            Err(err) => {
                debug!(error = %err, "malformed query, replying FormErr");
                return dns::build_formerr_raw(datagram);
            }
        };

        self.rules.record_query(&query.domain, chrono::Utc::now());

        match self.rules.rule_for_domain(&query.domain, self.config.wildcard_root_policy).await {
            Ok(Some(rule)) if rule.action == RuleAction::Block => {
                self.emit_query_event(&query, "blocked", rule.custom_message.as_deref());
                synthesize_block_reply(&query)
            }
            Ok(_) => {
                self.emit_query_event(&query, "forwarded", None);
                self.forward_upstream(&query, flow, datagram).await
            }
            Err(err) => {
                warn!(error = %err, "rule lookup failed, forwarding as a fail-open");
                self.forward_upstream(&query, flow, datagram).await
            }
        }
    }

    fn emit_query_event(&self, query: &Query, outcome: &str, custom_message: Option<&str>) {
        if let Some(telemetry) = &self.telemetry {
            let mut fields = HashMap::new();
            fields.insert("domain".to_string(), query.domain.clone());
            fields.insert("outcome".to_string(), outcome.to_string());
            if let Some(message) = custom_message {
                fields.insert("custom_message".to_string(), message.to_string());
            }
            telemetry.emit(TelemetryEvent::new(TelemetryEventType::DnsQuery, fields));
        }
    }

    async fn forward_upstream(&self, query: &Query, flow: &FlowMetadata, original: &[u8]) -> Vec<u8> {
        let resolver_ip = self.config.upstream_resolver.ip();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let binding = match self.binder.bind(
                query.transaction_id,
                resolver_ip,
                &self.config.upstream_resolver.to_string(),
                flow,
            ) {
                Ok(binding) => binding,
                Err(_) => return dns::build_servfail(query),
            };

            let bind_addr: SocketAddr = match binding.interface_type {
                InterfaceType::Loopback => "127.0.0.1:0".parse().unwrap(),
                _ => "0.0.0.0:0".parse().unwrap(),
            };

            let send_result = self.send_and_receive(bind_addr, original).await;
            match send_result {
                Ok(response_bytes) => {
                    self.retry.clear(query.transaction_id);
                    self.binder.clear_transaction(query.transaction_id);
                    return self.apply_ttl_ceiling(response_bytes);
                }
                Err(reason) => {
                    let decision = self.retry.on_failure(
                        query.transaction_id,
                        reason,
                        &self.config.upstream_resolver.to_string(),
                        Some(&binding.interface_name),
                        None,
                    );
                    match decision {
                        RetryDecision::Retry { delay } => {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            continue;
                        }
                        RetryDecision::Exhausted { .. } => {
                            self.binder.clear_transaction(query.transaction_id);
                            return dns::build_servfail(query);
                        }
                    }
                }
            }
        }
    }

    async fn send_and_receive(&self, bind_addr: SocketAddr, original: &[u8]) -> Result<Vec<u8>, RetryReason> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|_| RetryReason::InterfaceUnavailable)?;
        socket
            .send_to(original, self.config.upstream_resolver)
            .await
            .map_err(|_| RetryReason::NetworkError)?;

        let mut buf = [0u8; 512];
        match tokio::time::timeout(self.config.upstream_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => Ok(buf[..len].to_vec()),
            Ok(Err(_)) => Err(RetryReason::PeerClosed),
            Err(_) => Err(RetryReason::Timeout),
        }
    }

    fn apply_ttl_ceiling(&self, response_bytes: Vec<u8>) -> Vec<u8> {
        match self.config.ttl_ceiling {
            Some(ceiling) => dns::update_ttl(&response_bytes, ceiling).unwrap_or(response_bytes),
            None => response_bytes,
        }
    }
}

fn synthesize_block_reply(query: &Query) -> Vec<u8> {
    use crate::dns::QType;
    match query.qtype {
        QType::A => dns::build_blocked_a(query),
        QType::AAAA => dns::build_blocked_aaaa(query),
        _ => dns::build_nxdomain(query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::build_query;
    use crate::rules::{NewRule, RuleStoreConfig};

    async fn spawn_store() -> Arc<RuleStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::spawn(RuleStoreConfig::new(dir.path().join("rules.db"))).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn malformed_datagram_gets_formerr_reply() {
        let store = spawn_store().await;
        let binder = Arc::new(InterfaceBinder::new(Default::default(), false));
        let retry = Arc::new(RetryController::default());
        let engine = ProxyEngine::new(ProxyConfig::default(), store, binder, retry, None);
        let reply = engine.handle_datagram(&FlowMetadata::default(), b"\x00").await;
        assert!(!reply.is_empty());
    }

    #[tokio::test]
    async fn blocked_domain_synthesizes_local_answer() {
        let store = spawn_store().await;
        store
            .add_rules(vec![NewRule {
                domain: "blocked.example.com".into(),
                action: RuleAction::Block,
                ..Default::default()
            }])
            .await
            .unwrap();

        let binder = Arc::new(InterfaceBinder::new(Default::default(), false));
        let retry = Arc::new(RetryController::default());
        let engine = ProxyEngine::new(ProxyConfig::default(), store, binder, retry, None);

        let query_bytes = build_query(1234, "blocked.example.com", crate::dns::QType::A, true);
        let reply = engine.handle_datagram(&FlowMetadata::default(), &query_bytes).await;
        let parsed = dns::parse_response(&reply).unwrap();
        assert_eq!(parsed.answers, vec!["127.0.0.1".to_string()]);
    }
}
