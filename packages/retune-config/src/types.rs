use std::{collections::BTreeMap, path::PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	#[serde(default)]
	pub cache: Cache,
	/// Optional. Map keys are environment names matched against `service.environment`.
	#[serde(default)]
	pub environments: BTreeMap<String, Environment>,
	#[serde(default)]
	pub optimizer: Optimizer,
	#[serde(default)]
	pub tuner: Tuner,
	#[serde(default)]
	pub workflow: Workflow,
	/// Map keys are exact repository names or `*` glob patterns. Inner keys are intent labels,
	/// or `*` for an override shared by every intent.
	#[serde(default)]
	pub repositories: BTreeMap<String, BTreeMap<String, PolicyOverride>>,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
	#[serde(default)]
	pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
	pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Cache {
	pub enabled: bool,
	pub max_size: usize,
	pub ttl_secs: u64,
	pub admission_threshold: f64,
	/// Zero disables the background sweep.
	pub cleanup_interval_secs: u64,
}
impl Default for Cache {
	fn default() -> Self {
		Self {
			enabled: true,
			max_size: 1_000,
			ttl_secs: 3_600,
			admission_threshold: 0.7,
			cleanup_interval_secs: 300,
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct Environment {
	pub cache: Option<Cache>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Optimizer {
	pub learning_rate: f64,
	pub max_iterations: u32,
	pub convergence_threshold: f64,
	pub min_signals_per_intent: usize,
	pub min_weight: f64,
	pub max_weight: f64,
}
impl Default for Optimizer {
	fn default() -> Self {
		Self {
			learning_rate: 0.01,
			max_iterations: 100,
			convergence_threshold: 0.001,
			min_signals_per_intent: 5,
			min_weight: 0.1,
			max_weight: 5.0,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Tuner {
	pub max_iterations: u32,
	pub convergence_threshold: f64,
	pub min_signals_per_intent: usize,
}
impl Default for Tuner {
	fn default() -> Self {
		Self { max_iterations: 50, convergence_threshold: 0.001, min_signals_per_intent: 5 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Workflow {
	pub window_days: u32,
	/// Zero disables the periodic run; the workflow then only runs on demand.
	pub interval_secs: u64,
	pub auto_apply: bool,
	pub invalidate_cache_on_apply: bool,
	pub steps: WorkflowSteps,
}
impl Default for Workflow {
	fn default() -> Self {
		Self {
			window_days: 30,
			interval_secs: 86_400,
			auto_apply: false,
			invalidate_cache_on_apply: false,
			steps: WorkflowSteps::default(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkflowSteps {
	pub collect_signals: WorkflowStep,
	pub optimize_weights: WorkflowStep,
	pub tune_policies: WorkflowStep,
	pub update_cache: WorkflowStep,
}
impl Default for WorkflowSteps {
	fn default() -> Self {
		Self {
			collect_signals: WorkflowStep { timeout_ms: 60_000, retries: 2, required: true },
			optimize_weights: WorkflowStep { timeout_ms: 30_000, retries: 0, required: false },
			tune_policies: WorkflowStep { timeout_ms: 30_000, retries: 0, required: false },
			update_cache: WorkflowStep { timeout_ms: 5_000, retries: 1, required: false },
		}
	}
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WorkflowStep {
	pub timeout_ms: u64,
	#[serde(default)]
	pub retries: u32,
	#[serde(default)]
	pub required: bool,
}

/// A partial policy. Absent fields fall through to the layer below.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyOverride {
	pub max_depth: Option<u32>,
	pub include_symbols: Option<bool>,
	pub include_files: Option<bool>,
	pub include_content: Option<bool>,
	pub early_stop_threshold: Option<u32>,
	pub seed_weights: Option<BTreeMap<String, f64>>,
}
