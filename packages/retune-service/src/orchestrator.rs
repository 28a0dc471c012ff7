use std::{
	future::Future,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use uuid::Uuid;

use crate::{
	Collaborators, Error, Result,
	analyzer::{self, InteractionNotes, OutcomeAnalyzer, OutcomeSignal, SatisfactionMetrics},
	cache::{CacheSettings, SignatureCache},
	gate::PolicyGate,
	optimizer::{OptimizationResult, OptimizerOptions, ParameterChange, WeightOptimizer},
	tuner::{PolicyTuner, TunerOptions},
};
use retune_config::{Config, Workflow, WorkflowStep};
use retune_domain::{
	gate::{RepositoryOverrides, SearchContext},
	intent::IntentLabel,
	policy::{self, IntentWeights, PolicyBounds, PolicyDecision, PolicyTable, ValidationError},
};
use retune_storage::models::{NewInteraction, SessionRecord};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
	CollectSignals,
	OptimizeWeights,
	TunePolicies,
	ApplyPolicies,
	UpdateCache,
}
impl StepName {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::CollectSignals => "collect_signals",
			Self::OptimizeWeights => "optimize_weights",
			Self::TunePolicies => "tune_policies",
			Self::ApplyPolicies => "apply_policies",
			Self::UpdateCache => "update_cache",
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
	Succeeded,
	Failed,
	Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepReport {
	pub step: StepName,
	pub status: StepStatus,
	pub attempts: u32,
	pub duration_ms: u64,
	pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
	Succeeded,
	Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowReport {
	pub run_id: Uuid,
	pub window_days: u32,
	#[serde(with = "time::serde::rfc3339")]
	pub started_at: OffsetDateTime,
	pub status: RunStatus,
	pub signals_processed: usize,
	pub metrics: Option<SatisfactionMetrics>,
	pub weight_improvement: f64,
	pub policy_improvement: f64,
	pub parameter_changes: Vec<ParameterChange>,
	pub validation_errors: Vec<ValidationError>,
	pub optimizations_applied: bool,
	pub steps: Vec<StepReport>,
	pub errors: Vec<String>,
	pub duration_ms: u64,
}
impl WorkflowReport {
	fn new(window_days: u32) -> Self {
		Self {
			run_id: Uuid::new_v4(),
			window_days,
			started_at: OffsetDateTime::now_utc(),
			status: RunStatus::Succeeded,
			signals_processed: 0,
			metrics: None,
			weight_improvement: 0.0,
			policy_improvement: 0.0,
			parameter_changes: Vec::new(),
			validation_errors: Vec::new(),
			optimizations_applied: false,
			steps: Vec::new(),
			errors: Vec::new(),
			duration_ms: 0,
		}
	}

	pub fn succeeded(&self) -> bool {
		self.status == RunStatus::Succeeded
	}

	pub fn step(&self, step: StepName) -> Option<&StepReport> {
		self.steps.iter().find(|report| report.step == step)
	}
}

/// The per-query decision, with the classification it was made for.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDecision {
	pub intent: IntentLabel,
	pub confidence: Option<f64>,
	pub entities: Vec<String>,
	pub decision: PolicyDecision,
	/// The classifier was unavailable and the conservative default was used.
	pub degraded: bool,
}

/// An outcome reported by the caller after a search finished.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionOutcome {
	pub session_id: Uuid,
	pub query: String,
	pub intent: IntentLabel,
	pub satisfied: bool,
	pub confidence: Option<f64>,
	pub time_to_fix_secs: Option<f64>,
	pub token_usage: Option<u32>,
	pub token_budget: Option<u32>,
	pub repository: Option<String>,
	pub branch: Option<String>,
	pub language: Option<String>,
	pub bundle_id: Option<String>,
	/// Signature to cache `bundle_id` under when the outcome is satisfying.
	pub cache_signature: Option<String>,
}
impl InteractionOutcome {
	pub fn new(
		session_id: Uuid,
		query: impl Into<String>,
		intent: IntentLabel,
		satisfied: bool,
	) -> Self {
		Self {
			session_id,
			query: query.into(),
			intent,
			satisfied,
			confidence: None,
			time_to_fix_secs: None,
			token_usage: None,
			token_budget: None,
			repository: None,
			branch: None,
			language: None,
			bundle_id: None,
			cache_signature: None,
		}
	}

	fn notes(&self) -> InteractionNotes {
		InteractionNotes {
			intent: Some(self.intent.as_str().to_string()),
			confidence: self.confidence,
			repository: self.repository.clone(),
			branch: self.branch.clone(),
			language: self.language.clone(),
			time_to_fix_secs: self.time_to_fix_secs,
			token_usage: self.token_usage,
			token_budget: self.token_budget,
		}
	}
}

struct Scheduler {
	shutdown: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

/// Owns the live policy table, the signature cache, and the tuning workflow.
///
/// The query path (`evaluate`, `check_cache`, `store_in_cache`, `record_interaction`) never
/// waits on the workflow. The workflow runs at most once at a time per instance and replaces
/// the policy table in one swap, only after the new table has been persisted.
pub struct Orchestrator {
	gate: Arc<PolicyGate>,
	cache: Option<Arc<SignatureCache>>,
	collaborators: Collaborators,
	analyzer: OutcomeAnalyzer,
	weight_optimizer: WeightOptimizer,
	tuner: PolicyTuner,
	workflow: Workflow,
	run_lock: tokio::sync::Mutex<()>,
	scheduler: Mutex<Option<Scheduler>>,
}
impl Orchestrator {
	pub fn new(cfg: &Config, collaborators: Collaborators) -> Self {
		let cache = cfg
			.cache
			.enabled
			.then(|| Arc::new(SignatureCache::new(CacheSettings::from_config(&cfg.cache))));

		let overrides = RepositoryOverrides::from_config(&cfg.repositories);

		Self::with_parts(
			PolicyGate::new(PolicyTable::builtin(), overrides),
			cache,
			collaborators,
			OptimizerOptions::from_config(&cfg.optimizer),
			TunerOptions::from_config(&cfg.tuner, &cfg.optimizer),
			cfg.workflow.clone(),
		)
	}

	pub fn with_parts(
		gate: PolicyGate,
		cache: Option<Arc<SignatureCache>>,
		collaborators: Collaborators,
		optimizer: OptimizerOptions,
		tuner: TunerOptions,
		workflow: Workflow,
	) -> Self {
		let gate = Arc::new(gate);

		Self {
			analyzer: OutcomeAnalyzer::new(collaborators.clone(), Arc::clone(&gate)),
			gate,
			cache,
			collaborators,
			weight_optimizer: WeightOptimizer::new(optimizer),
			tuner: PolicyTuner::new(tuner),
			workflow,
			run_lock: tokio::sync::Mutex::new(()),
			scheduler: Mutex::new(None),
		}
	}

	pub fn policies(&self) -> Arc<PolicyTable> {
		self.gate.table()
	}

	pub fn cache(&self) -> Option<&Arc<SignatureCache>> {
		self.cache.as_ref()
	}

	pub fn analyzer(&self) -> &OutcomeAnalyzer {
		&self.analyzer
	}

	pub fn evaluate(&self, intent: IntentLabel, context: &SearchContext) -> PolicyDecision {
		self.gate.evaluate(intent, context)
	}

	/// Classifies `query` and evaluates its policy. A classifier failure degrades to the built-in
	/// `search` policy without contextual adjustments.
	pub async fn evaluate_query(&self, query: &str, mut context: SearchContext) -> QueryDecision {
		match self.collaborators.classifier.classify(query).await {
			Ok(classification) => {
				context.confidence.get_or_insert(classification.confidence);

				if context.query_length == 0 {
					context.query_length = query.chars().count();
				}

				QueryDecision {
					intent: classification.intent,
					confidence: Some(classification.confidence),
					decision: self.evaluate(classification.intent, &context),
					entities: classification.entities,
					degraded: false,
				}
			},
			Err(err) => {
				tracing::warn!(error = %err, "Intent classifier failed. Using the default policy.");

				QueryDecision {
					intent: IntentLabel::Search,
					confidence: None,
					entities: Vec::new(),
					decision: policy::default_policy(IntentLabel::Search),
					degraded: true,
				}
			},
		}
	}

	pub fn check_cache(&self, signature: &str) -> Option<String> {
		self.cache.as_ref()?.get(signature).map(|entry| entry.bundle_id)
	}

	pub fn store_in_cache(&self, signature: &str, bundle_id: &str, satisfaction: f64) -> bool {
		self.cache.as_ref().is_some_and(|cache| cache.set(signature, bundle_id, satisfaction))
	}

	pub async fn open_session(
		&self,
		repository: Option<&str>,
		branch: Option<&str>,
	) -> Result<SessionRecord> {
		self.collaborators.interactions.create_session(repository, branch).await
	}

	/// Persists the outcome in the background and caches satisfying bundles right away.
	///
	/// An unknown session is created from the outcome's repository and branch first. Storage
	/// failures are logged and never reach the caller; the returned handle only lets callers
	/// wait for the write. Outside a Tokio runtime nothing is persisted and `None` is returned.
	pub fn record_interaction(&self, outcome: InteractionOutcome) -> Option<JoinHandle<()>> {
		if outcome.satisfied
			&& let (Some(signature), Some(bundle_id)) =
				(outcome.cache_signature.as_deref(), outcome.bundle_id.as_deref())
		{
			self.store_in_cache(signature, bundle_id, 1.0);
		}

		let runtime = match Handle::try_current() {
			Ok(runtime) => runtime,
			Err(err) => {
				tracing::error!(
					session_id = %outcome.session_id,
					error = %err,
					"No runtime to record the interaction on. Dropping it."
				);

				return None;
			},
		};
		let notes = match serde_json::to_string(&outcome.notes()) {
			Ok(notes) => Some(notes),
			Err(err) => {
				tracing::warn!(error = %err, "Failed to encode interaction notes.");

				None
			},
		};
		let interaction = NewInteraction {
			session_id: outcome.session_id,
			query: outcome.query,
			bundle_id: outcome.bundle_id,
			satisfied: Some(outcome.satisfied),
			notes,
			created_at: OffsetDateTime::now_utc(),
		};
		let (repository, branch) = (outcome.repository, outcome.branch);
		let interactions = Arc::clone(&self.collaborators.interactions);

		Some(runtime.spawn(async move {
			let session_id = interaction.session_id;

			if let Err(err) = interactions
				.ensure_session(session_id, repository.as_deref(), branch.as_deref())
				.await
			{
				tracing::error!(%session_id, error = %err, "Failed to resolve the session.");

				return;
			}
			if let Err(err) = interactions.create_interaction(interaction).await {
				tracing::error!(%session_id, error = %err, "Failed to record interaction.");
			}
		}))
	}

	/// Loads the persisted policy table, if any, and makes it live.
	pub async fn restore_policies(&self) -> Result<bool> {
		let Some(mut table) = self.collaborators.policies.load_policies().await? else {
			return Ok(false);
		};

		for error in table.clamp(&PolicyBounds::default()) {
			tracing::warn!(error = %error, "Clamped persisted policy parameter.");
		}

		self.gate.replace(Arc::new(table));

		tracing::info!("Restored persisted policy table.");

		Ok(true)
	}

	/// Collects signals, optimizes, tunes, and applies when allowed.
	///
	/// Fails with [`Error::WorkflowBusy`] when another run holds this instance. Every other
	/// failure is reported in the returned report.
	pub async fn run_workflow(&self, window_days: u32) -> Result<WorkflowReport> {
		let Ok(_guard) = self.run_lock.try_lock() else {
			return Err(Error::WorkflowBusy);
		};
		let started = Instant::now();
		let mut report = WorkflowReport::new(window_days);

		tracing::info!(run_id = %report.run_id, window_days, "Policy tuning run started.");

		self.run_steps(window_days, &mut report).await;

		report.duration_ms = elapsed_ms(started);

		match report.status {
			RunStatus::Succeeded => tracing::info!(
				run_id = %report.run_id,
				signals = report.signals_processed,
				applied = report.optimizations_applied,
				changes = report.parameter_changes.len(),
				duration_ms = report.duration_ms,
				"Policy tuning run finished."
			),
			RunStatus::Failed => tracing::error!(
				run_id = %report.run_id,
				errors = ?report.errors,
				"Policy tuning run failed."
			),
		}

		Ok(report)
	}

	async fn run_steps(&self, window_days: u32, report: &mut WorkflowReport) {
		let steps = &self.workflow.steps;
		let current = self.gate.table();
		let signals = match self
			.run_step(StepName::CollectSignals, steps.collect_signals, report, || {
				self.analyzer.analyze(window_days)
			})
			.await
		{
			Ok(signals) => Arc::new(signals),
			Err(err) => {
				if self.step_failed(StepName::CollectSignals, steps.collect_signals, err, report) {
					return;
				}

				Arc::new(Vec::new())
			},
		};

		report.signals_processed = signals.len();
		report.metrics = Some(analyzer::compute_satisfaction_metrics(&signals));

		let weights = match self
			.run_step(StepName::OptimizeWeights, steps.optimize_weights, report, || {
				optimize_weights(
					self.weight_optimizer.clone(),
					Arc::clone(&signals),
					current.seed_weights(),
				)
			})
			.await
		{
			Ok(result) => Some(result),
			Err(err) => {
				let step = StepName::OptimizeWeights;

				if self.step_failed(step, steps.optimize_weights, err, report) {
					return;
				}

				None
			},
		};
		let mut candidate = current.as_ref().clone();

		if let Some(weights) = weights {
			candidate = candidate.with_seed_weights(&weights.optimized);
			report.weight_improvement = weights.improvement;
			report.parameter_changes.extend(weights.parameter_changes);
			report.validation_errors.extend(weights.validation_errors);
		}

		let base = Arc::new(candidate.clone());
		let tuned = match self
			.run_step(StepName::TunePolicies, steps.tune_policies, report, || {
				tune_policies(self.tuner.clone(), Arc::clone(&signals), Arc::clone(&base))
			})
			.await
		{
			Ok(result) => Some(result),
			Err(err) => {
				if self.step_failed(StepName::TunePolicies, steps.tune_policies, err, report) {
					return;
				}

				None
			},
		};

		if let Some(tuned) = tuned {
			candidate = tuned.optimized;
			report.policy_improvement = tuned.improvement;
			report.parameter_changes.extend(tuned.parameter_changes);
			report.validation_errors.extend(tuned.validation_errors);
		}

		let improved = report.weight_improvement + report.policy_improvement > 0.0;

		if !self.workflow.auto_apply || !improved || candidate == *current {
			tracing::info!(
				auto_apply = self.workflow.auto_apply,
				improved,
				"Policy table left unchanged."
			);
			report.steps.push(StepReport {
				step: StepName::ApplyPolicies,
				status: StepStatus::Skipped,
				attempts: 0,
				duration_ms: 0,
				error: None,
			});
		} else if let Err(err) = self.apply_policies(candidate, report).await {
			report.status = RunStatus::Failed;
			report.errors.push(err.to_string());

			return;
		}

		self.update_cache(report).await;
	}

	/// Persists `candidate`, then makes it live. A failed save leaves the live table untouched.
	///
	/// The save and the swap run on their own task, so dropping this future part way through
	/// never separates the persisted table from the live one.
	async fn apply_policies(
		&self,
		candidate: PolicyTable,
		report: &mut WorkflowReport,
	) -> Result<()> {
		let started = Instant::now();
		let gate = Arc::clone(&self.gate);
		let policies = Arc::clone(&self.collaborators.policies);
		let commit = tokio::spawn(async move {
			policies.save_policies(&candidate).await?;
			gate.replace(Arc::new(candidate));

			Ok::<_, Error>(())
		});
		let persisted = commit.await.unwrap_or_else(|err| {
			Err(Error::Storage { message: format!("Policy commit task failed: {err}.") })
		});
		let result = match persisted {
			Ok(()) => {
				report.optimizations_applied = true;

				tracing::info!(
					changes = report.parameter_changes.len(),
					"Applied tuned policy table."
				);

				Ok(())
			},
			Err(err) => {
				tracing::error!(error = %err, "Failed to persist tuned policies. Live table kept.");

				Err(Error::Application { message: err.to_string() })
			},
		};

		report.steps.push(StepReport {
			step: StepName::ApplyPolicies,
			status: if result.is_ok() { StepStatus::Succeeded } else { StepStatus::Failed },
			attempts: 1,
			duration_ms: elapsed_ms(started),
			error: result.as_ref().err().map(ToString::to_string),
		});

		result
	}

	async fn update_cache(&self, report: &mut WorkflowReport) {
		let settings = self.workflow.steps.update_cache;
		let Some(cache) = self.cache.as_ref() else {
			report.steps.push(StepReport {
				step: StepName::UpdateCache,
				status: StepStatus::Skipped,
				attempts: 0,
				duration_ms: 0,
				error: None,
			});

			return;
		};
		let invalidate = report.optimizations_applied && self.workflow.invalidate_cache_on_apply;
		let outcome = self
			.run_step(StepName::UpdateCache, settings, report, || async {
				let invalidated = if invalidate { cache.invalidate(None) } else { 0 };
				let expired = cache.sweep_expired();

				Ok((invalidated, expired))
			})
			.await;

		match outcome {
			Ok((invalidated, expired)) =>
				tracing::info!(invalidated, expired, "Signature cache updated."),
			Err(err) => {
				self.step_failed(StepName::UpdateCache, settings, err, report);
			},
		}
	}

	/// Runs one step with a timeout per attempt and `retries` extra attempts.
	async fn run_step<T, F, Fut>(
		&self,
		step: StepName,
		settings: WorkflowStep,
		report: &mut WorkflowReport,
		mut operation: F,
	) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let started = Instant::now();
		let max_attempts = settings.retries.saturating_add(1);
		let timeout = Duration::from_millis(settings.timeout_ms);
		let mut last_error = None;

		for attempt in 1..=max_attempts {
			let err = match tokio::time::timeout(timeout, operation()).await {
				Ok(Ok(value)) => {
					tracing::info!(
						step = step.as_str(),
						attempt,
						duration_ms = elapsed_ms(started),
						"Workflow step finished."
					);
					report.steps.push(StepReport {
						step,
						status: StepStatus::Succeeded,
						attempts: attempt,
						duration_ms: elapsed_ms(started),
						error: None,
					});

					return Ok(value);
				},
				Ok(Err(err)) => err,
				Err(_) => Error::StepTimeout {
					step: step.as_str().to_string(),
					timeout_ms: settings.timeout_ms,
				},
			};

			tracing::warn!(
				step = step.as_str(),
				attempt,
				max_attempts,
				error = %err,
				"Workflow step attempt failed."
			);

			last_error = Some(err);
		}

		let err = last_error.unwrap_or_else(|| Error::StepFailed {
			step: step.as_str().to_string(),
			message: "No attempt was made.".to_string(),
		});

		report.steps.push(StepReport {
			step,
			status: StepStatus::Failed,
			attempts: max_attempts,
			duration_ms: elapsed_ms(started),
			error: Some(err.to_string()),
		});

		Err(err)
	}

	/// Records a failed step. Returns `true` when the step was required and the run must stop.
	fn step_failed(
		&self,
		step: StepName,
		settings: WorkflowStep,
		err: Error,
		report: &mut WorkflowReport,
	) -> bool {
		report.errors.push(format!("{}: {err}", step.as_str()));

		if settings.required {
			tracing::error!(step = step.as_str(), error = %err, "Required workflow step failed.");

			report.status = RunStatus::Failed;

			return true;
		}

		tracing::warn!(
			step = step.as_str(),
			error = %err,
			"Optional workflow step failed. Skipping."
		);

		false
	}

	/// Starts the cache sweep and, when an interval is configured, the periodic workflow.
	pub fn start(self: &Arc<Self>) {
		if let Some(cache) = self.cache.as_ref() {
			cache.start_sweeper();
		}
		if self.workflow.interval_secs == 0 {
			return;
		}

		let mut scheduler = self.scheduler.lock().unwrap_or_else(|err| err.into_inner());

		if scheduler.is_some() {
			return;
		}

		let (shutdown, mut shutdown_rx) = watch::channel(false);
		let orchestrator = Arc::clone(self);
		let period = Duration::from_secs(self.workflow.interval_secs);
		let window_days = self.workflow.window_days;
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);

			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = shutdown_rx.changed() => break,
					_ = ticker.tick() => {},
				}
				// A started run always finishes; shutdown is observed between runs.
				if let Err(err) = orchestrator.run_workflow(window_days).await {
					tracing::warn!(error = %err, "Scheduled policy tuning run skipped.");
				}
				if *shutdown_rx.borrow() {
					break;
				}
			}
		});

		*scheduler = Some(Scheduler { shutdown, handle });

		tracing::info!(
			interval_secs = self.workflow.interval_secs,
			"Policy tuning scheduler started."
		);
	}

	/// Stops every background task and waits for each to exit.
	pub async fn stop(&self) {
		let scheduler = self.scheduler.lock().unwrap_or_else(|err| err.into_inner()).take();

		if let Some(Scheduler { shutdown, handle }) = scheduler {
			let _ = shutdown.send(true);

			if let Err(err) = handle.await {
				tracing::error!(error = %err, "Policy tuning scheduler exited abnormally.");
			}
		}
		if let Some(cache) = self.cache.as_ref() {
			cache.stop_sweeper().await;
		}
	}
}

async fn optimize_weights(
	optimizer: WeightOptimizer,
	signals: Arc<Vec<OutcomeSignal>>,
	weights: IntentWeights,
) -> Result<OptimizationResult<IntentWeights>> {
	tokio::task::spawn_blocking(move || optimizer.optimize(&signals, &weights))
		.await
		.map_err(|err| Error::StepFailed {
			step: StepName::OptimizeWeights.as_str().to_string(),
			message: err.to_string(),
		})
}

async fn tune_policies(
	tuner: PolicyTuner,
	signals: Arc<Vec<OutcomeSignal>>,
	table: Arc<PolicyTable>,
) -> Result<OptimizationResult<PolicyTable>> {
	tokio::task::spawn_blocking(move || tuner.tune(&signals, &table))
		.await
		.map_err(|err| Error::StepFailed {
			step: StepName::TunePolicies.as_str().to_string(),
			message: err.to_string(),
		})
}

fn elapsed_ms(started: Instant) -> u64 {
	u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
