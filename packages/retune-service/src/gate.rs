use std::sync::Arc;

use arc_swap::ArcSwap;

use retune_domain::{
	gate::{self, RepositoryOverrides, SearchContext},
	intent::IntentLabel,
	policy::{PolicyDecision, PolicyTable},
};

/// The live policy table plus the repository overrides it is evaluated with.
///
/// Readers take a snapshot of the table and never observe a partial replacement; writers swap a
/// whole new table in.
pub struct PolicyGate {
	table: ArcSwap<PolicyTable>,
	overrides: RepositoryOverrides,
}
impl PolicyGate {
	pub fn new(table: PolicyTable, overrides: RepositoryOverrides) -> Self {
		Self { table: ArcSwap::from_pointee(table), overrides }
	}

	pub fn evaluate(&self, intent: IntentLabel, context: &SearchContext) -> PolicyDecision {
		let table = self.table.load();

		gate::evaluate(&table, &self.overrides, intent, context)
	}

	pub fn table(&self) -> Arc<PolicyTable> {
		self.table.load_full()
	}

	/// Installs `table` and returns the table it replaced.
	pub fn replace(&self, table: Arc<PolicyTable>) -> Arc<PolicyTable> {
		self.table.swap(table)
	}

	pub fn overrides(&self) -> &RepositoryOverrides {
		&self.overrides
	}
}
impl Default for PolicyGate {
	fn default() -> Self {
		Self::new(PolicyTable::builtin(), RepositoryOverrides::default())
	}
}
