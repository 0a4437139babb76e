//! Thin demonstration harness binding the library end to end. Not a
//! supported daemon surface — see `proxy::ProxyEngine` for the library
//! entry point itself.

use clap::Parser;
use sinkproxy::binder::{InterfaceBinder, RetryController};
use sinkproxy::cache::{RuleSetCache, RuleSetCacheConfig};
use sinkproxy::formats::ParserRegistry;
use sinkproxy::manifest::{ManifestCache, ManifestResolver, ManifestResolverConfig};
use sinkproxy::preferences::{PreferenceFile, Preferences};
use sinkproxy::proxy::{ProxyConfig, ProxyEngine};
use sinkproxy::rules::{RuleStore, RuleStoreConfig};
use sinkproxy::schedule::{Priority, Scheduler};
use sinkproxy::telemetry;
use sinkproxy::update::{ManifestUpdateExecutor, StaticSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sinkproxyd", about = "sinkproxy demo harness")]
struct Cli {
    /// Path to a TOML preferences file; falls back to built-in defaults.
    #[arg(long, default_value = "sinkproxy.toml")]
    config: PathBuf,

    /// UDP address to listen on.
    #[arg(long, default_value = "127.0.0.1:5300")]
    bind: String,

    /// Directory for the rule store, cache and manifest cache.
    #[arg(long, default_value = "./sinkproxy-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let preference_file = load_preferences(&cli.config);
    let preferences = Preferences::snapshot(&preference_file);

    std::fs::create_dir_all(&cli.data_dir)?;

    let rule_store = Arc::new(RuleStore::spawn(RuleStoreConfig::new(cli.data_dir.join("rules.db")))?);

    let cache = Arc::new(RuleSetCache::open(RuleSetCacheConfig {
        disk_dir: cli.data_dir.join("cache"),
        memory_byte_budget: 16 * 1024 * 1024,
        disk_byte_budget: 256 * 1024 * 1024,
        max_age: chrono::Duration::hours(6),
    })?);

    let manifest_resolver = preferences.manifest_url.as_ref().map(|base_url| {
        Arc::new(ManifestResolver::new(
            ManifestResolverConfig {
                search_paths: vec![cli.data_dir.join("manifests")],
                preferred_extensions: vec![preferences.manifest_format.clone()],
                http_base_url: Some(base_url.clone()),
            },
            Arc::new(ManifestCache::open(cli.data_dir.join("manifest-cache")).expect("manifest cache dir")),
        ))
    });

    let executor = Arc::new(ManifestUpdateExecutor::new(
        manifest_resolver,
        Vec::<StaticSource>::new(),
        rule_store.clone(),
        cache,
        Arc::new(ParserRegistry::with_builtin_formats()),
        preferences.validate_tls,
        preferences.fetch_timeout_secs,
    ));
    let scheduler = Scheduler::spawn(executor, None);
    scheduler.enqueue("default", Priority::Normal);

    let binder = Arc::new(InterfaceBinder::new(preferences.binding_strategy.clone(), preferences.sticky_bindings));
    let retry = Arc::new(RetryController::new(preferences.max_retries, preferences.initial_backoff_ms));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let telemetry_handle = if preferences.telemetry_enabled {
        Some(telemetry::spawn(
            telemetry::TelemetryConfig {
                buffer_dir: cli.data_dir.clone(),
                ..telemetry::TelemetryConfig::default()
            },
            Arc::new(LoggingTelemetrySink),
            shutdown_tx.subscribe(),
        ))
    } else {
        None
    };

    let proxy = Arc::new(ProxyEngine::new(
        ProxyConfig {
            upstream_timeout: std::time::Duration::from_secs(preferences.fetch_timeout_secs.max(1)),
            wildcard_root_policy: preferences.wildcard_root_policy,
            ..ProxyConfig::default()
        },
        rule_store,
        binder,
        retry,
        telemetry_handle,
    ));

    let socket = Arc::new(UdpSocket::bind(&cli.bind).await?);
    info!(bind = %cli.bind, "sinkproxy listening");

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

    loop {
        let mut buf = [0u8; 512];
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(());
                break;
            }
            _ = shutdown_rx.recv() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "failed to receive datagram");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let proxy = proxy.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let flow = sinkproxy::binder::FlowMetadata::default();
                    let reply = proxy.handle_datagram(&flow, &datagram).await;
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        warn!(error = %err, peer = %peer, "failed to send reply");
                    }
                });
            }
        }
    }

    Ok(())
}

fn load_preferences(path: &PathBuf) -> PreferenceFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
            warn!(error = %err, path = %path.display(), "failed to parse preferences file, using defaults");
            PreferenceFile::default()
        }),
        Err(_) => PreferenceFile::default(),
    }
}

struct LoggingTelemetrySink;

#[async_trait::async_trait]
impl telemetry::TelemetrySink for LoggingTelemetrySink {
    async fn send_batch(&self, events: &[telemetry::TelemetryEvent]) -> Result<(), sinkproxy::error::CoreError> {
        for event in events {
            info!(event_type = ?event.event_type, fields = ?event.fields, "telemetry event");
        }
        Ok(())
    }
}
