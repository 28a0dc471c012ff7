use std::{
	io::{BufWriter, Write},
	sync::Arc,
	time::Instant,
};

use time::{Duration, OffsetDateTime};

use super::{config, memory_collaborators, signal, signals};
use retune_domain::{
	gate::RepositoryOverrides,
	intent::IntentLabel,
	policy::PolicyTable,
	signature,
};
use retune_service::{
	Collaborators, OutcomeAnalyzer, PolicyGate,
	analyzer::{self, bundle_shape},
};
use retune_testkit::{InteractionBuilder, TestStoreDir, bundle_structure, malformed_interaction};

#[test]
fn metrics_over_no_signals_are_all_zero() {
	let metrics = analyzer::compute_satisfaction_metrics(&[]);

	assert_eq!(metrics.total_signals, 0);
	assert_eq!(metrics.satisfied_signals, 0);
	assert_eq!(metrics.overall_satisfaction_rate, 0.0);
	assert!(metrics.avg_time_to_fix_secs.is_none());
	assert!(metrics.avg_token_usage.is_none());
	assert!(metrics.by_intent.is_empty());
	assert!(metrics.by_signature.is_empty());
}

#[test]
fn metrics_break_down_by_intent() {
	let mut all = signals(IntentLabel::Symbol, 50, 35);

	all.extend(signals(IntentLabel::Config, 50, 20));

	let metrics = analyzer::compute_satisfaction_metrics(&all);

	assert_eq!(metrics.total_signals, 100);
	assert_eq!(metrics.satisfied_signals, 55);
	assert_eq!(metrics.overall_satisfaction_rate, 0.55);
	assert_eq!(metrics.by_intent[&IntentLabel::Symbol].satisfaction_rate, 0.70);
	assert_eq!(metrics.by_intent[&IntentLabel::Config].satisfaction_rate, 0.40);
}

#[test]
fn group_totals_sum_to_the_overall_total() {
	let mut all = Vec::new();

	for (index, intent) in IntentLabel::ALL.into_iter().enumerate() {
		for offset in 0..(index + 3) {
			let mut signal = signal(intent, offset % 2 == 0);

			signal.bundle_signature = format!("b_{:016x}", offset % 4);
			signal.time_to_fix_secs = (offset % 3 == 0).then_some(offset as f64);

			all.push(signal);
		}
	}

	let metrics = analyzer::compute_satisfaction_metrics(&all);
	let by_intent: usize = metrics.by_intent.values().map(|group| group.total).sum();
	let by_signature: usize = metrics.by_signature.values().map(|group| group.total).sum();
	let satisfied: usize = metrics.by_intent.values().map(|group| group.satisfied).sum();

	assert_eq!(by_intent, metrics.total_signals);
	assert_eq!(by_signature, metrics.total_signals);
	assert_eq!(satisfied, metrics.satisfied_signals);
	assert!(metrics.avg_time_to_fix_secs.is_some());
	assert_eq!(metrics.avg_token_usage, Some(100.0));
}

#[tokio::test]
async fn analysis_skips_unusable_records_and_recovers_policy_context() {
	let cfg = config(
		r#"
[repositories."acme/*".symbol]
max_depth = 6
"#,
	);
	let (store, collaborators) = memory_collaborators();
	let gate = Arc::new(PolicyGate::new(
		PolicyTable::builtin(),
		RepositoryOverrides::from_config(&cfg.repositories),
	));
	let analyzer = OutcomeAnalyzer::new(collaborators, gate);
	let bundle =
		bundle_structure("bundle-1", "symbol", &[("vector", 3), ("symbol", 2)], 800, 4_000);

	store.put_bundle(bundle.clone());
	store.import_interactions([
		InteractionBuilder::new("where is parse_manifest defined")
			.satisfied(true)
			.intent("symbol")
			.repository("acme/monorepo")
			.bundle("bundle-1")
			.token_usage(640)
			.time_to_fix_secs(4.5)
			.build(),
		InteractionBuilder::new("feature flag setting for billing")
			.satisfied(false)
			.bundle("bundle-unknown")
			.build(),
		InteractionBuilder::new("no verdict").intent("docs").build(),
		malformed_interaction("broken notes"),
		InteractionBuilder::new("too old").satisfied(true).days_ago(45).build(),
	]);

	let signals = analyzer.analyze(30).await.expect("Analysis should succeed.");

	assert_eq!(signals.len(), 2, "Unexpected signals: {signals:?}");

	let symbol = &signals[0];
	let config_signal = &signals[1];

	assert_eq!(symbol.intent, IntentLabel::Symbol);
	assert_eq!(symbol.bundle_signature, signature::bundle_signature(&bundle_shape(&bundle)));
	assert_eq!(symbol.token_usage, 640);
	assert_eq!(symbol.time_to_fix_secs, Some(4.5));
	assert!(symbol.satisfied);
	assert!(symbol.policy.max_depth >= 5, "Override was not applied: {:?}", symbol.policy);

	assert_eq!(config_signal.intent, IntentLabel::Config);
	assert_eq!(
		config_signal.bundle_signature,
		signature::fallback_bundle_signature("bundle-unknown")
	);
	assert_eq!(
		config_signal.token_usage,
		analyzer::estimate_tokens("feature flag setting for billing")
	);
	assert!(!config_signal.satisfied);
}

#[tokio::test]
async fn analysis_window_is_inclusive_of_recent_records_only() {
	let (store, collaborators) = memory_collaborators();
	let analyzer = OutcomeAnalyzer::new(collaborators, Arc::new(PolicyGate::default()));

	store.import_interactions([
		InteractionBuilder::new("recent").satisfied(true).intent("api").days_ago(1).build(),
		InteractionBuilder::new("stale").satisfied(true).intent("api").days_ago(10).build(),
	]);

	let signals = analyzer
		.analyze_since(OffsetDateTime::now_utc() - Duration::days(5))
		.await
		.expect("Analysis should succeed.");

	assert_eq!(signals.len(), 1);
	assert_eq!(signals[0].query, "recent");
}

#[tokio::test]
async fn large_jsonl_histories_are_analyzed_in_one_pass() {
	const RECORDS: usize = 5_000;

	let dir = TestStoreDir::new().expect("Failed to create test store directory.");

	{
		let open = |name: &str| {
			BufWriter::new(
				std::fs::File::create(dir.path().join(name)).expect("Failed to create store file."),
			)
		};
		let mut interactions = open("interactions.jsonl");
		let mut bundles = open("bundles.jsonl");

		for index in 0..RECORDS {
			let bundle_id = format!("bundle-{index}");
			let record = InteractionBuilder::new(format!("where is handler_{index} defined"))
				.intent("symbol")
				.bundle(bundle_id.as_str())
				.satisfied(index % 3 == 0)
				.days_ago(1)
				.build();
			let bundle =
				bundle_structure(&bundle_id, "symbol", &[("vector", index % 7)], 500, 4_000);

			serde_json::to_writer(&mut interactions, &record).expect("Failed to encode record.");
			writeln!(interactions).expect("Failed to write record.");
			serde_json::to_writer(&mut bundles, &bundle).expect("Failed to encode bundle.");
			writeln!(bundles).expect("Failed to write bundle.");
		}

		interactions.flush().expect("Failed to flush interactions.");
		bundles.flush().expect("Failed to flush bundles.");
	}

	let store = Arc::new(dir.open_store().await.expect("Failed to open store."));
	let analyzer =
		OutcomeAnalyzer::new(Collaborators::from_store(store), Arc::new(PolicyGate::default()));
	let started = Instant::now();
	let signals = analyzer.analyze(30).await.expect("Analysis should succeed.");
	let elapsed = started.elapsed();

	assert_eq!(signals.len(), RECORDS);
	assert_ne!(signals[0].bundle_signature, signals[1].bundle_signature);
	assert!(elapsed.as_secs() < 20, "Analysis took {elapsed:?}.");
}
