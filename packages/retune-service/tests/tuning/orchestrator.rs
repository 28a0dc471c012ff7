use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use uuid::Uuid;

use super::{FaultyStore, OfflineClassifier, config, faulty_collaborators, memory_collaborators};
use retune_domain::{
	gate::SearchContext,
	intent::IntentLabel,
	policy::{self, PolicyTable},
};
use retune_service::{
	Collaborators, Error, InteractionOutcome, Orchestrator, PolicyStore, StepName, StepStatus,
};
use retune_storage::{memory::MemoryStore, models::InteractionRecord};
use retune_testkit::InteractionBuilder;

const AUTO_APPLY: &str = r#"
[workflow]
auto_apply = true
interval_secs = 0
"#;

/// Ten symbol lookups of which only one satisfied the user.
fn poor_symbol_history() -> Vec<InteractionRecord> {
	(0..10)
		.map(|index| {
			InteractionBuilder::new(format!("where is handler_{index} defined"))
				.intent("symbol")
				.satisfied(index == 0)
				.days_ago(1)
				.build()
		})
		.collect()
}

fn seeded_memory_store() -> (Arc<MemoryStore>, Collaborators) {
	let (store, collaborators) = memory_collaborators();

	store.import_interactions(poor_symbol_history());

	(store, collaborators)
}

async fn record(orchestrator: &Orchestrator, outcome: InteractionOutcome) {
	orchestrator
		.record_interaction(outcome)
		.expect("Expected the write to be scheduled.")
		.await
		.expect("Record task panicked.");
}

#[tokio::test]
async fn failed_persistence_restores_the_previous_table() {
	let store = FaultyStore { fail_policy_saves: true, ..FaultyStore::default() };

	store.inner.import_interactions(poor_symbol_history());

	let (_store, collaborators) = faulty_collaborators(store);
	let orchestrator = Orchestrator::new(&config(AUTO_APPLY), collaborators);
	let before = orchestrator.policies();
	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");

	assert!(!report.succeeded());
	assert!(!report.optimizations_applied);
	assert!(!report.parameter_changes.is_empty(), "Tuning should have proposed changes.");
	assert!(Arc::ptr_eq(&orchestrator.policies(), &before));
	assert_eq!(*orchestrator.policies(), PolicyTable::builtin());

	let apply = report.step(StepName::ApplyPolicies).expect("Expected an apply step.");

	assert_eq!(apply.status, StepStatus::Failed);
	assert!(report.step(StepName::UpdateCache).is_none());
	assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn applied_tables_are_persisted_and_restorable() {
	let (store, collaborators) = seeded_memory_store();
	let cfg = config(&format!("{AUTO_APPLY}invalidate_cache_on_apply = true\n"));
	let orchestrator = Orchestrator::new(&cfg, collaborators.clone());

	assert!(orchestrator.store_in_cache("b_0123456789abcdef", "bundle-1", 0.9));

	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");

	assert!(report.succeeded(), "Unexpected failure: {:?}", report.errors);
	assert!(report.optimizations_applied);
	assert_eq!(report.signals_processed, 10);
	assert_eq!(
		report.step(StepName::ApplyPolicies).map(|step| step.status),
		Some(StepStatus::Succeeded)
	);
	assert_ne!(*orchestrator.policies(), PolicyTable::builtin());
	assert!(store.load_policy_snapshot().is_some());
	assert!(orchestrator.check_cache("b_0123456789abcdef").is_none());

	let restarted = Orchestrator::new(&cfg, collaborators);

	assert!(restarted.restore_policies().await.expect("Restore should succeed."));
	assert_eq!(*restarted.policies(), *orchestrator.policies());
}

#[tokio::test]
async fn cancelled_runs_keep_the_live_and_persisted_tables_together() {
	let store = FaultyStore {
		policy_save_delay: Some(Duration::from_millis(1_500)),
		..FaultyStore::default()
	};

	store.inner.import_interactions(poor_symbol_history());

	let (store, collaborators) = faulty_collaborators(store);
	let orchestrator = Orchestrator::new(&config(AUTO_APPLY), collaborators.clone());
	let before = orchestrator.policies();
	let cancelled =
		tokio::time::timeout(Duration::from_millis(300), orchestrator.run_workflow(30)).await;

	assert!(cancelled.is_err(), "The run should still be saving.");
	assert!(Arc::ptr_eq(&orchestrator.policies(), &before));
	assert!(store.inner.load_policy_snapshot().is_none());

	tokio::time::sleep(Duration::from_millis(2_000)).await;

	assert!(store.inner.load_policy_snapshot().is_some());
	assert_ne!(*orchestrator.policies(), PolicyTable::builtin());

	let restarted = Orchestrator::new(&config(AUTO_APPLY), collaborators);

	assert!(restarted.restore_policies().await.expect("Restore should succeed."));
	assert_eq!(*restarted.policies(), *orchestrator.policies());
}

#[tokio::test]
async fn without_auto_apply_the_table_is_left_alone() {
	let (store, collaborators) = seeded_memory_store();
	let orchestrator = Orchestrator::new(&config("[workflow]\ninterval_secs = 0\n"), collaborators);
	let before = orchestrator.policies();
	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");

	assert!(report.succeeded());
	assert!(!report.optimizations_applied);
	assert_eq!(
		report.step(StepName::ApplyPolicies).map(|step| step.status),
		Some(StepStatus::Skipped)
	);
	assert!(Arc::ptr_eq(&orchestrator.policies(), &before));
	assert!(store.load_policy_snapshot().is_none());
}

#[tokio::test]
async fn restore_without_a_snapshot_keeps_the_builtin_table() {
	let (_store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators.clone());

	assert!(!orchestrator.restore_policies().await.expect("Restore should succeed."));
	assert_eq!(*orchestrator.policies(), PolicyTable::builtin());

	let mut table = PolicyTable::builtin();
	let mut api = policy::default_policy(IntentLabel::Api);

	api.max_depth = 40;
	table.insert(IntentLabel::Api, api);
	collaborators.policies.save_policies(&table).await.expect("Save should succeed.");

	assert!(orchestrator.restore_policies().await.expect("Restore should succeed."));
	assert_eq!(orchestrator.policies().get(IntentLabel::Api).max_depth, 10);
}

#[tokio::test]
async fn a_second_concurrent_run_is_rejected() {
	let store = FaultyStore {
		interaction_delay: Some(Duration::from_millis(200)),
		..FaultyStore::default()
	};
	let (_store, collaborators) = faulty_collaborators(store);
	let orchestrator = Arc::new(Orchestrator::new(&config(""), collaborators));
	let first = tokio::spawn({
		let orchestrator = Arc::clone(&orchestrator);

		async move { orchestrator.run_workflow(30).await }
	});

	tokio::time::sleep(Duration::from_millis(50)).await;

	assert!(matches!(orchestrator.run_workflow(30).await, Err(Error::WorkflowBusy)));

	let report = first.await.expect("Run task panicked.").expect("First run should report.");

	assert!(report.succeeded());
	assert!(orchestrator.run_workflow(30).await.is_ok());
}

#[tokio::test]
async fn a_failing_required_step_is_retried_then_stops_the_run() {
	let store = FaultyStore { fail_interactions: true, ..FaultyStore::default() };
	let (store, collaborators) = faulty_collaborators(store);
	let cfg = config(
		r#"
[workflow.steps.collect_signals]
timeout_ms = 1000
retries = 1
required = true
"#,
	);
	let orchestrator = Orchestrator::new(&cfg, collaborators);
	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");
	let collect = report.step(StepName::CollectSignals).expect("Expected a collect step.");

	assert!(!report.succeeded());
	assert_eq!(collect.status, StepStatus::Failed);
	assert_eq!(collect.attempts, 2);
	assert_eq!(store.calls(), 2);
	assert!(report.step(StepName::OptimizeWeights).is_none());
	assert!(report.metrics.is_none());
}

#[tokio::test]
async fn a_failing_optional_step_is_skipped() {
	let store = FaultyStore { fail_interactions: true, ..FaultyStore::default() };
	let (store, collaborators) = faulty_collaborators(store);
	let cfg = config(
		r#"
[workflow.steps.collect_signals]
timeout_ms = 1000
required = false
"#,
	);
	let orchestrator = Orchestrator::new(&cfg, collaborators);
	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");

	assert!(report.succeeded());
	assert_eq!(store.calls(), 1);
	assert_eq!(report.signals_processed, 0);
	assert_eq!(report.errors.len(), 1);
	assert!(report.errors[0].starts_with("collect_signals"));
	assert_eq!(
		report.step(StepName::OptimizeWeights).map(|step| step.status),
		Some(StepStatus::Succeeded)
	);
}

#[tokio::test]
async fn slow_steps_time_out_on_every_attempt() {
	let store = FaultyStore {
		interaction_delay: Some(Duration::from_millis(300)),
		..FaultyStore::default()
	};
	let (store, collaborators) = faulty_collaborators(store);
	let cfg = config(
		r#"
[workflow.steps.collect_signals]
timeout_ms = 20
retries = 2
required = true
"#,
	);
	let orchestrator = Orchestrator::new(&cfg, collaborators);
	let report = orchestrator.run_workflow(30).await.expect("Workflow should produce a report.");
	let collect = report.step(StepName::CollectSignals).expect("Expected a collect step.");

	assert!(!report.succeeded());
	assert_eq!(collect.attempts, 3);
	assert_eq!(store.calls(), 3);
	assert!(
		collect.error.as_deref().is_some_and(|error| error.contains("timed out")),
		"Unexpected error: {:?}",
		collect.error
	);
}

#[tokio::test]
async fn satisfying_outcomes_are_cached_and_stored() {
	let (store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let session = orchestrator
		.open_session(Some("acme/monorepo"), Some("main"))
		.await
		.expect("Session should open.");
	let mut outcome = InteractionOutcome::new(
		session.session_id,
		"where is parse_manifest defined",
		IntentLabel::Symbol,
		true,
	);

	outcome.bundle_id = Some("bundle-7".to_string());
	outcome.cache_signature = Some("b_00000000000000aa".to_string());
	outcome.time_to_fix_secs = Some(2.0);

	record(&orchestrator, outcome).await;

	assert_eq!(orchestrator.check_cache("b_00000000000000aa"), Some("bundle-7".to_string()));

	let records = store.interactions_since(OffsetDateTime::UNIX_EPOCH);

	assert_eq!(records.len(), 1);
	assert_eq!(records[0].satisfied, Some(true));
	assert!(records[0].notes.as_deref().is_some_and(|notes| notes.contains("\"symbol\"")));
}

#[tokio::test]
async fn outcomes_for_unknown_sessions_create_the_session() {
	let (store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let session_id = Uuid::new_v4();
	let mut outcome =
		InteractionOutcome::new(session_id, "where is the retry loop", IntentLabel::Search, true);

	outcome.repository = Some("acme/monorepo".to_string());
	outcome.branch = Some("release".to_string());

	record(&orchestrator, outcome).await;

	let session = store.session(session_id).expect("Session should have been created.");
	let records = store.interactions_since(OffsetDateTime::UNIX_EPOCH);

	assert_eq!(session.repository.as_deref(), Some("acme/monorepo"));
	assert_eq!(session.branch.as_deref(), Some("release"));
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].session_id, session_id);
}

#[test]
fn recording_outside_a_runtime_still_caches_and_returns() {
	let (store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let mut outcome =
		InteractionOutcome::new(Uuid::new_v4(), "parse_manifest", IntentLabel::Symbol, true);

	outcome.bundle_id = Some("bundle-9".to_string());
	outcome.cache_signature = Some("b_00000000000000cc".to_string());

	assert!(orchestrator.record_interaction(outcome).is_none());
	assert_eq!(orchestrator.check_cache("b_00000000000000cc"), Some("bundle-9".to_string()));
	assert!(store.interactions_since(OffsetDateTime::UNIX_EPOCH).is_empty());
}

#[tokio::test]
async fn unsatisfying_outcomes_are_not_cached() {
	let (_store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let session = orchestrator.open_session(None, None).await.expect("Session should open.");
	let mut outcome =
		InteractionOutcome::new(session.session_id, "retry logic", IntentLabel::Search, false);

	outcome.bundle_id = Some("bundle-8".to_string());
	outcome.cache_signature = Some("b_00000000000000bb".to_string());

	record(&orchestrator, outcome).await;

	assert!(orchestrator.check_cache("b_00000000000000bb").is_none());
}

#[tokio::test]
async fn recording_failures_never_reach_the_caller() {
	let store = FaultyStore { fail_interactions: true, ..FaultyStore::default() };
	let (store, collaborators) = faulty_collaborators(store);
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let outcome =
		InteractionOutcome::new(Uuid::new_v4(), "deploy config", IntentLabel::Config, true);

	record(&orchestrator, outcome).await;

	assert!(store.inner.interactions_since(OffsetDateTime::UNIX_EPOCH).is_empty());
}

#[tokio::test]
async fn classifier_outages_degrade_to_the_default_policy() {
	let (_store, mut collaborators) = memory_collaborators();

	collaborators.classifier = Arc::new(OfflineClassifier);

	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let context =
		SearchContext { repository: Some("acme/monorepo".to_string()), ..SearchContext::default() };
	let decision = orchestrator.evaluate_query("where is parse_manifest defined", context).await;

	assert!(decision.degraded);
	assert_eq!(decision.intent, IntentLabel::Search);
	assert_eq!(decision.decision, policy::default_policy(IntentLabel::Search));
}

#[tokio::test]
async fn classified_queries_are_not_degraded() {
	let (_store, collaborators) = memory_collaborators();
	let orchestrator = Orchestrator::new(&config(""), collaborators);
	let decision = orchestrator
		.evaluate_query("where is parse_manifest defined", SearchContext::default())
		.await;

	assert!(!decision.degraded);
	assert!(decision.confidence.is_some());
}

#[tokio::test]
async fn the_scheduler_runs_until_stopped() {
	let (store, collaborators) = faulty_collaborators(FaultyStore::default());
	let cfg = config(
		r#"
[cache]
cleanup_interval_secs = 1

[workflow]
interval_secs = 1
"#,
	);
	let orchestrator = Arc::new(Orchestrator::new(&cfg, collaborators));

	orchestrator.start();
	tokio::time::sleep(Duration::from_millis(1_300)).await;
	orchestrator.stop().await;

	let calls = store.calls();

	assert!(calls >= 1, "The scheduled run never started.");

	tokio::time::sleep(Duration::from_millis(1_200)).await;

	assert_eq!(store.calls(), calls);
}
