//! `sinkproxy`: an in-process DNS intercepting proxy. Parses and
//! synthesizes DNS datagrams, matches them against a persistent,
//! manifest-resolved rule set, and forwards the rest upstream over an
//! interface-aware, retrying UDP path.
//!
//! The crate is a library first (see `proxy::ProxyEngine`); `main.rs`
//! is a thin demonstration harness, not a supported daemon surface.

pub mod binder;
pub mod cache;
pub mod dns;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod manifest;
pub mod preferences;
pub mod proxy;
pub mod rules;
pub mod schedule;
pub mod telemetry;
pub mod update;
