mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Cache, Config, Environment, Optimizer, PolicyOverride, Service, Storage, Tuner, Workflow,
	WorkflowStep, WorkflowSteps,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.storage.path.as_os_str().is_empty() {
		return Err(Error::Validation { message: "storage.path must be non-empty.".to_string() });
	}
	if cfg.cache.max_size == 0 {
		return Err(Error::Validation {
			message: "cache.max_size must be greater than zero.".to_string(),
		});
	}
	if cfg.cache.ttl_secs == 0 {
		return Err(Error::Validation {
			message: "cache.ttl_secs must be greater than zero.".to_string(),
		});
	}
	if !cfg.cache.admission_threshold.is_finite() {
		return Err(Error::Validation {
			message: "cache.admission_threshold must be a finite number.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&cfg.cache.admission_threshold) {
		return Err(Error::Validation {
			message: "cache.admission_threshold must be in the range 0.0-1.0.".to_string(),
		});
	}

	validate_optimizer(&cfg.optimizer)?;

	if cfg.tuner.max_iterations == 0 {
		return Err(Error::Validation {
			message: "tuner.max_iterations must be greater than zero.".to_string(),
		});
	}
	if !cfg.tuner.convergence_threshold.is_finite() || cfg.tuner.convergence_threshold < 0.0 {
		return Err(Error::Validation {
			message: "tuner.convergence_threshold must be a finite number, zero or greater."
				.to_string(),
		});
	}
	if cfg.tuner.min_signals_per_intent == 0 {
		return Err(Error::Validation {
			message: "tuner.min_signals_per_intent must be greater than zero.".to_string(),
		});
	}
	if cfg.workflow.window_days == 0 {
		return Err(Error::Validation {
			message: "workflow.window_days must be greater than zero.".to_string(),
		});
	}

	for (label, step) in [
		("collect_signals", &cfg.workflow.steps.collect_signals),
		("optimize_weights", &cfg.workflow.steps.optimize_weights),
		("tune_policies", &cfg.workflow.steps.tune_policies),
		("update_cache", &cfg.workflow.steps.update_cache),
	] {
		if step.timeout_ms == 0 {
			return Err(Error::Validation {
				message: format!("workflow.steps.{label}.timeout_ms must be greater than zero."),
			});
		}
	}

	for (repository, intents) in &cfg.repositories {
		if repository.trim().is_empty() {
			return Err(Error::Validation {
				message: "repositories keys must be non-empty.".to_string(),
			});
		}

		for (intent, policy) in intents {
			validate_policy_override(repository, intent, policy)?;
		}
	}

	Ok(())
}

fn validate_optimizer(optimizer: &Optimizer) -> Result<()> {
	if !optimizer.learning_rate.is_finite() || optimizer.learning_rate <= 0.0 {
		return Err(Error::Validation {
			message: "optimizer.learning_rate must be a finite number greater than zero."
				.to_string(),
		});
	}
	if optimizer.max_iterations == 0 {
		return Err(Error::Validation {
			message: "optimizer.max_iterations must be greater than zero.".to_string(),
		});
	}
	if !optimizer.convergence_threshold.is_finite() || optimizer.convergence_threshold < 0.0 {
		return Err(Error::Validation {
			message: "optimizer.convergence_threshold must be a finite number, zero or greater."
				.to_string(),
		});
	}
	if optimizer.min_signals_per_intent == 0 {
		return Err(Error::Validation {
			message: "optimizer.min_signals_per_intent must be greater than zero.".to_string(),
		});
	}
	if !optimizer.min_weight.is_finite() || !optimizer.max_weight.is_finite() {
		return Err(Error::Validation {
			message: "optimizer.min_weight and optimizer.max_weight must be finite numbers."
				.to_string(),
		});
	}
	if optimizer.min_weight <= 0.0 || optimizer.min_weight >= optimizer.max_weight {
		return Err(Error::Validation {
			message: "optimizer.min_weight must be greater than zero and less than optimizer.max_weight."
				.to_string(),
		});
	}

	Ok(())
}

fn validate_policy_override(repository: &str, intent: &str, policy: &PolicyOverride) -> Result<()> {
	if let Some(weights) = policy.seed_weights.as_ref() {
		for (source, weight) in weights {
			if !weight.is_finite() {
				return Err(Error::Validation {
					message: format!(
						"repositories.{repository}.{intent}.seed_weights.{source} must be a finite number."
					),
				});
			}
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.service.environment.as_deref().map(|env| env.trim().is_empty()).unwrap_or(false) {
		cfg.service.environment = None;
	}

	if let Some(environment) = cfg.service.environment.as_deref()
		&& let Some(cache) =
			cfg.environments.get(environment).and_then(|profile| profile.cache.clone())
	{
		cfg.cache = cache;
	}

	cfg.repositories.retain(|repository, _| !repository.trim().is_empty());
}
