//! Manifest resolution: declarative per-device rule-source bundles that
//! include one another and carry conditional overlays.

pub mod cache;
pub mod model;
pub mod predicate;
pub mod resolver;

pub use cache::ManifestCache;
pub use model::{ConditionalItem, Manifest, ManifestRuleSource, ResolvedManifest, SourceLocation};
pub use predicate::{EvaluationContext, Predicate};
pub use resolver::{ManifestResolver, ManifestResolverConfig};
