//! Source & AE Registry (§4.B): lookup of permitted calling AEs and local called AEs.
//!
//! Thread-safe read, copy-on-reload: readers never block on a concurrent reload, per the
//! "registries are immutable between reloads" design note (§9).

use crate::config::{AppConfig, CalledAeConfig, SourceConfig};
use arc_swap::ArcSwap;
use std::sync::Arc;

struct Snapshot {
	sources: Vec<SourceConfig>,
	called_aets: Vec<CalledAeConfig>,
}

/// Pure lookup over the current configuration snapshot.
pub struct Registry {
	snapshot: ArcSwap<Snapshot>,
}

impl Registry {
	pub fn new(config: &AppConfig) -> Self {
		Self {
			snapshot: ArcSwap::from_pointee(Snapshot {
				sources: config.sources.clone(),
				called_aets: config.called_aets.clone(),
			}),
		}
	}

	/// Atomically swaps in a fresh configuration snapshot. Existing lookups in flight continue
	/// to observe the snapshot they started with; new lookups see the new one.
	pub fn reload(&self, config: &AppConfig) {
		self.snapshot.store(Arc::new(Snapshot {
			sources: config.sources.clone(),
			called_aets: config.called_aets.clone(),
		}));
	}

	/// Resolves a calling AE title to its configured source id, or `None` if unrecognized.
	pub fn resolve_calling(&self, ae: &str) -> Option<String> {
		self.snapshot
			.load()
			.sources
			.iter()
			.find(|source| source.aet == ae)
			.map(|source| source.source_id.clone())
	}

	/// Resolves a local called AE title to its configuration, or `None` if unrecognized.
	pub fn resolve_called(&self, ae: &str) -> Option<CalledAeConfig> {
		self.snapshot
			.load()
			.called_aets
			.iter()
			.find(|called| called.aet == ae)
			.cloned()
	}

	/// Whether `source_id` is allowed to push into the given called-AE configuration.
	pub fn is_source_allowed(called: &CalledAeConfig, source_id: &str) -> bool {
		called.allowed_sources.is_empty() || called.allowed_sources.iter().any(|s| s == source_id)
	}

	/// Whether the given SOP class UID is allowed for the given called-AE configuration.
	pub fn is_sop_allowed(called: &CalledAeConfig, sop_class_uid: &str) -> bool {
		called.allowed_sops.is_empty() || called.allowed_sops.iter().any(|uid| uid == sop_class_uid)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::GroupingKeyKind;

	fn config_with(sources: Vec<SourceConfig>, called: Vec<CalledAeConfig>) -> AppConfig {
		use crate::config::{HttpServerConfig, PlatformConfig, ServerConfig};
		AppConfig {
			telemetry: Default::default(),
			server: ServerConfig {
				aet: String::from("ADAPTER"),
				http: HttpServerConfig::default(),
				dimse: Default::default(),
				max_associations: ServerConfig::default_max_associations(),
			},
			staging: Default::default(),
			sources,
			called_aets: called,
			kv: Default::default(),
			platform: PlatformConfig {
				base_url: String::from("http://localhost:9000"),
				timeout_ms: 30_000,
				max_job_name_len: 64,
			},
			worker: Default::default(),
			retrieval: Default::default(),
		}
	}

	#[test]
	fn resolves_known_calling_and_called_aets() {
		let config = config_with(
			vec![SourceConfig {
				aet: String::from("PACS1"),
				source_id: String::from("src1"),
			}],
			vec![CalledAeConfig {
				aet: String::from("CLARA1"),
				grouping_key: GroupingKeyKind::StudyInstanceUid,
				timeout_ms: 5_000,
				max_age_ms: 60_000,
				allowed_sops: vec![],
				allowed_sources: vec![],
				pipeline_ids: vec![String::from("pipeline-1")],
				priority: 128,
			}],
		);

		let registry = Registry::new(&config);
		assert_eq!(registry.resolve_calling("PACS1").as_deref(), Some("src1"));
		assert!(registry.resolve_calling("UNKNOWN").is_none());
		assert!(registry.resolve_called("CLARA1").is_some());
		assert!(registry.resolve_called("UNKNOWN").is_none());
	}

	#[test]
	fn reload_replaces_snapshot_atomically() {
		let config = config_with(vec![], vec![]);
		let registry = Registry::new(&config);
		assert!(registry.resolve_calling("PACS1").is_none());

		let reloaded = config_with(
			vec![SourceConfig {
				aet: String::from("PACS1"),
				source_id: String::from("src1"),
			}],
			vec![],
		);
		registry.reload(&reloaded);
		assert_eq!(registry.resolve_calling("PACS1").as_deref(), Some("src1"));
	}
}
