//! SQL text for the stage → production merge.
//!
//! Pure string building so the exact statements can be inspected, logged in
//! dry-run mode and asserted on without a database.

use crate::reconcile::{MergeTarget, ReconcileStep};
use crate::record::quote_ident;

const PROD: &str = "p";
const STAGE: &str = "s";

/// The statements of one reconciliation, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatements {
    /// `None` when the target has no value columns to refresh.
    pub update: Option<String>,
    pub delete: String,
    pub insert: String,
    pub truncate: String,
    /// Row count of the staging table, run after TRUNCATE inside the transaction.
    pub verify: String,
}

impl MergeStatements {
    pub fn for_target(target: &MergeTarget) -> Self {
        let staging = target.staging().quoted();
        let production = target.production().quoted();
        let key_match = key_predicate(target.natural_key());

        let update = if target.value_columns().is_empty() {
            None
        } else {
            let assignments = target
                .value_columns()
                .iter()
                .map(|c| format!("{q} = {STAGE}.{q}", q = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "UPDATE {production} AS {PROD} SET {assignments} \
                 FROM {staging} AS {STAGE} \
                 WHERE {key_match} AND {changed}",
                changed = changed_predicate(target.value_columns()),
            ))
        };

        Self {
            update,
            delete: format!(
                "DELETE FROM {staging} AS {STAGE} USING {production} AS {PROD} WHERE {key_match}"
            ),
            insert: format!("INSERT INTO {production} SELECT * FROM {staging}"),
            truncate: format!("TRUNCATE TABLE {staging}"),
            verify: format!("SELECT COUNT(*) FROM {staging}"),
        }
    }

    /// The mutating statements paired with their step, skipping an absent UPDATE.
    pub fn in_order(&self) -> Vec<(ReconcileStep, &str)> {
        let mut steps = Vec::with_capacity(4);
        if let Some(update) = &self.update {
            steps.push((ReconcileStep::Update, update.as_str()));
        }
        steps.push((ReconcileStep::Delete, self.delete.as_str()));
        steps.push((ReconcileStep::Insert, self.insert.as_str()));
        steps.push((ReconcileStep::Truncate, self.truncate.as_str()));
        steps
    }
}

fn key_predicate(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("{PROD}.{q} = {STAGE}.{q}", q = quote_ident(k)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn changed_predicate(values: &[String]) -> String {
    let side = |alias: &str| {
        values
            .iter()
            .map(|c| format!("{alias}.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("({}) IS DISTINCT FROM ({})", side(PROD), side(STAGE))
}
