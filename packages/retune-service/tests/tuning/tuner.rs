use super::signal_with;
use retune_domain::{
	intent::IntentLabel,
	policy::{self, PolicyDecision, PolicyTable},
};
use retune_service::{OutcomeSignal, ParameterChange, ParameterValue, PolicyTuner, TunerOptions};

fn symbol_policy() -> PolicyDecision {
	policy::default_policy(IntentLabel::Symbol)
}

fn signals_with(
	count: usize,
	satisfied: bool,
	adjust: impl Fn(&mut PolicyDecision),
) -> Vec<OutcomeSignal> {
	(0..count)
		.map(|_| {
			let mut policy = symbol_policy();

			adjust(&mut policy);

			signal_with(IntentLabel::Symbol, satisfied, policy)
		})
		.collect()
}

fn tuned_symbol(signals: &[OutcomeSignal]) -> (PolicyDecision, Vec<ParameterChange>) {
	let result = PolicyTuner::default().tune(signals, &PolicyTable::builtin());
	let policy = result.optimized.get(IntentLabel::Symbol);

	(policy, result.parameter_changes)
}

#[test]
fn no_signals_leave_policies_unchanged() {
	let table = PolicyTable::builtin();
	let result = PolicyTuner::default().tune(&[], &table);

	assert_eq!(result.optimized, table);
	assert_eq!(result.iterations, 0);
	assert!(result.converged);
	assert!(result.parameter_changes.is_empty());
	assert!(result.validation_errors.is_empty());
}

#[test]
fn out_of_bounds_input_is_clamped_and_reported() {
	let mut table = PolicyTable::builtin();
	let mut api = policy::default_policy(IntentLabel::Api);

	api.max_depth = 14;
	api.early_stop_threshold = 0;
	table.insert(IntentLabel::Api, api);

	let result = PolicyTuner::default().tune(&[], &table);
	let fields: Vec<&str> =
		result.validation_errors.iter().map(|error| error.field.as_str()).collect();

	assert_eq!(fields, vec!["max_depth", "early_stop_threshold"]);
	assert_eq!(result.optimized.get(IntentLabel::Api).max_depth, 10);
	assert_eq!(result.optimized.get(IntentLabel::Api).early_stop_threshold, 1);
	assert_eq!(result.rollback, table);
}

#[test]
fn unsatisfied_low_thresholds_raise_early_stop_until_it_meets_satisfied_runs() {
	let mut signals = signals_with(6, true, |policy| policy.early_stop_threshold = 8);

	signals.extend(signals_with(6, false, |policy| policy.early_stop_threshold = 3));

	let (policy, changes) = tuned_symbol(&signals);

	assert_eq!(policy.early_stop_threshold, 8);

	let change = changes
		.iter()
		.find(|change| change.parameter == "early_stop_threshold")
		.expect("Expected an early stop change.");

	assert_eq!(change.old_value, ParameterValue::Integer(5));
	assert_eq!(change.new_value, ParameterValue::Integer(8));
	assert_eq!(change.confidence, 0.7);
	assert!(change.impact > 0.0 && change.impact < 1.0);
}

#[test]
fn long_resolutions_deepen_the_search() {
	let mut signals = signals_with(4, true, |_| {});

	signals.extend(signals_with(4, false, |_| {}));

	for (index, signal) in signals.iter_mut().enumerate() {
		signal.time_to_fix_secs = Some(if index < 6 { 15.0 } else { 2.0 });
	}

	let (policy, changes) = tuned_symbol(&signals);

	assert!(policy.max_depth > symbol_policy().max_depth);
	assert!(
		changes
			.iter()
			.any(|change| change.parameter == "max_depth" && change.confidence == 0.8),
		"Unexpected changes: {changes:?}"
	);
}

#[test]
fn quick_resolutions_narrow_the_search() {
	let mut signals = signals_with(5, true, |_| {});

	signals.extend(signals_with(5, false, |_| {}));

	for signal in &mut signals {
		signal.time_to_fix_secs = Some(1.0);
	}

	let (policy, _) = tuned_symbol(&signals);

	assert_eq!(policy.max_depth, symbol_policy().max_depth - 1);
}

#[test]
fn poorly_satisfying_flags_are_switched_off() {
	let mut signals = signals_with(1, true, |_| {});

	signals.extend(signals_with(9, false, |_| {}));

	let (policy, changes) = tuned_symbol(&signals);

	assert!(!policy.include_symbols);

	let change = changes
		.iter()
		.find(|change| change.parameter == "include_symbols")
		.expect("Expected a flag change.");

	assert_eq!(change.old_value, ParameterValue::Flag(true));
	assert_eq!(change.new_value, ParameterValue::Flag(false));
	assert_eq!(change.confidence, 0.9);
	assert_eq!(change.impact, 1.0);
}

#[test]
fn highly_satisfying_flags_are_switched_on() {
	let mut signals = signals_with(9, true, |policy| policy.include_files = true);

	signals.extend(signals_with(1, false, |policy| policy.include_files = true));

	let (policy, _) = tuned_symbol(&signals);

	assert!(policy.include_files);
}

#[test]
fn seed_weights_follow_satisfied_usage() {
	let mut signals = signals_with(6, true, |policy| {
		policy.seed_weights.insert("definition".to_string(), 2.5);
	});

	signals.extend(signals_with(6, false, |policy| {
		policy.seed_weights.insert("definition".to_string(), 1.5);
	}));

	let (policy, changes) = tuned_symbol(&signals);
	let definition = policy.seed_weights["definition"];

	assert!((definition - 2.5).abs() < 1e-9, "Unexpected definition weight {definition}.");
	assert!(changes.iter().any(|change| {
		change.parameter == "seed_weights.definition" && change.confidence == 0.6
	}));
}

#[test]
fn sparse_intents_are_not_tuned() {
	let signals = signals_with(4, false, |policy| policy.early_stop_threshold = 1);
	let options = TunerOptions { min_signals_per_intent: 5, ..TunerOptions::default() };
	let tuner = PolicyTuner::new(options);
	let result = tuner.tune(&signals, &PolicyTable::builtin());

	assert_eq!(result.optimized, PolicyTable::builtin());
	assert_eq!(result.iterations, 0);
}
