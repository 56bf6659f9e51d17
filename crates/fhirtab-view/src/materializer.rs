//! Row materialization.
//!
//! Applies a compiled [`Plan`] to one resource, walking the branch tree and
//! emitting flat rows. `forEach` branches fan rows out with inner-join
//! semantics, `forEachOrNull` with outer-join semantics, and `unionAll`
//! branches concatenate their alternatives. Sibling branches combine as a
//! cartesian product, mirroring the lateral-join shape the equivalent SQL
//! would take.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::compiler::{Branch, BranchKind, Plan, PlanColumn};
use crate::fhirpath::FhirPathEngine;

/// One output row: column name to value, in the plan's declared order.
///
/// Every emitted row carries exactly the plan's declared column set;
/// columns a resource does not populate hold `Value::Null`.
pub type Row = IndexMap<String, Value>;

/// Partially built row carrying only the columns its branch has set.
type PartialRow = IndexMap<String, Value>;

/// The result of applying a plan to one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializeOutcome {
    /// The resource's `resourceType` does not match the plan; skipped
    /// silently.
    TypeMismatch,

    /// A where clause excluded the resource.
    Filtered,

    /// The resource was admitted; zero or more rows were produced.
    Rows(Vec<Row>),
}

/// Applies a compiled plan to individual resources.
///
/// A materializer is created once per plan and shared across the whole
/// input stream; it owns the evaluation engine carrying the view's
/// constants.
pub struct Materializer {
    plan: Arc<Plan>,
    engine: FhirPathEngine,
}

impl Materializer {
    /// Create a materializer for the given plan.
    pub fn new(plan: Arc<Plan>) -> Self {
        let constants = plan
            .constants
            .iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect();
        Self {
            engine: FhirPathEngine::with_constants(constants),
            plan,
        }
    }

    /// The plan this materializer executes.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Materialize rows for one resource. Empty when the resource is
    /// filtered out, mismatched, or produces no rows; never partial.
    pub fn materialize(&self, resource: &Value) -> Vec<Row> {
        match self.materialize_outcome(resource) {
            MaterializeOutcome::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    /// Materialize one resource, distinguishing why nothing was produced.
    ///
    /// The stream processor uses this to keep type mismatches out of both
    /// the parsed and the invalid counters.
    pub fn materialize_outcome(&self, resource: &Value) -> MaterializeOutcome {
        let resource_type = resource.get("resourceType").and_then(Value::as_str);
        if resource_type != Some(self.plan.resource.as_str()) {
            return MaterializeOutcome::TypeMismatch;
        }

        for clause in &self.plan.where_clauses {
            if !self.engine.evaluate_predicate(clause, resource) {
                return MaterializeOutcome::Filtered;
            }
        }

        let mut combos: Vec<PartialRow> = vec![PartialRow::new()];
        for branch in &self.plan.branches {
            let set = self.rows_for_branch(branch, resource);
            if set.is_empty() {
                combos.clear();
                break;
            }
            combos = cross_merge(combos, &set);
        }

        let rows = combos
            .into_iter()
            .filter_map(|partial| self.assemble(partial))
            .collect();
        MaterializeOutcome::Rows(rows)
    }

    /// Rows contributed by one branch node evaluated in the given scope.
    fn rows_for_branch(&self, branch: &Branch, scope: &Value) -> Vec<PartialRow> {
        match branch.kind {
            BranchKind::Union => branch
                .children
                .iter()
                .flat_map(|child| self.rows_for_branch(child, scope))
                .collect(),
            BranchKind::Leaf => self.expand(branch, std::slice::from_ref(scope)),
            BranchKind::ForEach | BranchKind::ForEachOrNull => {
                let expression = branch
                    .iter_expression
                    .as_deref()
                    .expect("forEach branch carries an iteration expression");
                let elements = self.engine.evaluate(expression, scope);
                if elements.is_empty() {
                    return match branch.kind {
                        BranchKind::ForEach => Vec::new(),
                        _ => vec![null_subtree_row(branch)],
                    };
                }
                self.expand(branch, &elements)
            }
        }
    }

    /// Evaluate a branch's own columns and children against each scope
    /// element, fanning out one row set per element.
    fn expand(&self, branch: &Branch, elements: &[Value]) -> Vec<PartialRow> {
        let mut out = Vec::new();
        for element in elements {
            let mut rows = vec![self.eval_columns(&branch.columns, element)];
            for child in &branch.children {
                let set = self.rows_for_branch(child, element);
                if set.is_empty() {
                    rows.clear();
                    break;
                }
                rows = cross_merge(rows, &set);
            }
            out.extend(rows);
        }
        out
    }

    fn eval_columns(&self, columns: &[PlanColumn], scope: &Value) -> PartialRow {
        let mut partial = PartialRow::with_capacity(columns.len());
        for column in columns {
            let values = self.engine.evaluate(&column.path, scope);
            let value = if column.collection {
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::Array(values)
                }
            } else {
                values.into_iter().next().unwrap_or(Value::Null)
            };
            partial.insert(column.name.clone(), value);
        }
        partial
    }

    /// Fill a declared-column template from a partial row; all-null rows
    /// are suppressed.
    fn assemble(&self, partial: PartialRow) -> Option<Row> {
        let mut row: Row = self
            .plan
            .columns
            .iter()
            .map(|c| (c.name.clone(), Value::Null))
            .collect();
        for (name, value) in partial {
            row.insert(name, value);
        }
        if row.values().any(|v| !v.is_null()) {
            Some(row)
        } else {
            None
        }
    }
}

/// The single outer-join row for an unmatched `forEachOrNull`: every column
/// in the branch's subtree, null.
fn null_subtree_row(branch: &Branch) -> PartialRow {
    branch
        .subtree_column_names()
        .into_iter()
        .map(|name| (name, Value::Null))
        .collect()
}

/// Cartesian merge of two partial row sets, preserving traversal order.
fn cross_merge(lhs: Vec<PartialRow>, rhs: &[PartialRow]) -> Vec<PartialRow> {
    let mut out = Vec::with_capacity(lhs.len() * rhs.len());
    for left in &lhs {
        for right in rhs {
            let mut merged = left.clone();
            for (name, value) in right {
                merged.insert(name.clone(), value.clone());
            }
            out.push(merged);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::view_definition::ViewDefinition;
    use serde_json::json;

    fn materializer(view_json: serde_json::Value) -> Materializer {
        let view = ViewDefinition::from_json(&view_json).unwrap();
        Materializer::new(Arc::new(compile(&view).unwrap()))
    }

    fn row_values(row: &Row, names: &[&str]) -> Vec<Value> {
        names.iter().map(|n| row[*n].clone()).collect()
    }

    #[test]
    fn test_type_gate() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{"column": [{"name": "pid", "path": "id"}]}]
        }));

        assert_eq!(
            m.materialize_outcome(&json!({"resourceType": "Observation", "id": "o1"})),
            MaterializeOutcome::TypeMismatch
        );
        assert!(
            m.materialize(&json!({"resourceType": "Observation", "id": "o1"}))
                .is_empty()
        );
    }

    #[test]
    fn test_where_filter() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{"column": [{"name": "pid", "path": "id"}]}],
            "where": [{"path": "active = true"}]
        }));

        let admitted = json!({"resourceType": "Patient", "id": "1", "active": true});
        let excluded = json!({"resourceType": "Patient", "id": "2", "active": false});
        let missing = json!({"resourceType": "Patient", "id": "3"});

        assert_eq!(m.materialize(&admitted).len(), 1);
        assert_eq!(
            m.materialize_outcome(&excluded),
            MaterializeOutcome::Filtered
        );
        assert_eq!(
            m.materialize_outcome(&missing),
            MaterializeOutcome::Filtered
        );
    }

    #[test]
    fn test_rows_carry_full_declared_column_set() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [
                    {"name": "pid", "path": "id"},
                    {"name": "gender", "path": "gender"},
                    {"name": "birth_date", "path": "birthDate"}
                ]
            }]
        }));

        let rows = m.materialize(&json!({"resourceType": "Patient", "id": "1"}));
        assert_eq!(rows.len(), 1);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, ["pid", "gender", "birth_date"]);
        assert_eq!(rows[0]["gender"], Value::Null);
    }

    #[test]
    fn test_all_null_rows_suppressed() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "gender", "path": "gender"}]
            }]
        }));

        let rows = m.materialize(&json!({"resourceType": "Patient", "id": "1"}));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_foreach_inner_join() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "pid", "path": "getResourceKey()"}]
            }, {
                "forEach": "name",
                "column": [{"name": "family", "path": "family"}]
            }]
        }));

        // Two names fan out to two rows sharing the resource key.
        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "name": [{"family": "Chalmers"}, {"family": "Windsor"}]
        }));
        assert_eq!(rows.len(), 2);
        assert_eq!(row_values(&rows[0], &["pid", "family"]), [json!("1"), json!("Chalmers")]);
        assert_eq!(row_values(&rows[1], &["pid", "family"]), [json!("1"), json!("Windsor")]);

        // No names: inner join emits nothing.
        let rows = m.materialize(&json!({"resourceType": "Patient", "id": "2"}));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_foreach_or_null_outer_join() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "pid", "path": "getResourceKey()"}]
            }, {
                "forEachOrNull": "name",
                "column": [{"name": "family", "path": "family"}]
            }]
        }));

        let rows = m.materialize(&json!({"resourceType": "Patient", "id": "2"}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["pid"], json!("2"));
        assert_eq!(rows[0]["family"], Value::Null);
    }

    #[test]
    fn test_foreach_scalar_scope_is_single_element() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "forEach": "maritalStatus",
                "column": [{"name": "status_text", "path": "text"}]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "maritalStatus": {"text": "Married"}
        }));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status_text"], json!("Married"));
    }

    #[test]
    fn test_nested_foreach_fan_out() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "pid", "path": "getResourceKey()"}],
                "select": [{
                    "forEach": "address",
                    "column": [{"name": "city", "path": "city"}],
                    "select": [{
                        "forEach": "line",
                        "column": [{"name": "line", "path": "$this"}]
                    }]
                }]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "address": [
                {"city": "Springfield", "line": ["a", "b"]},
                {"city": "Shelbyville", "line": ["c"]}
            ]
        }));

        // 2 lines under the first address, 1 under the second.
        assert_eq!(rows.len(), 3);
        assert_eq!(row_values(&rows[0], &["pid", "city", "line"]),
                   [json!("1"), json!("Springfield"), json!("a")]);
        assert_eq!(row_values(&rows[1], &["pid", "city", "line"]),
                   [json!("1"), json!("Springfield"), json!("b")]);
        assert_eq!(row_values(&rows[2], &["pid", "city", "line"]),
                   [json!("1"), json!("Shelbyville"), json!("c")]);
    }

    #[test]
    fn test_union_all_concatenates_in_order() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "pid", "path": "getResourceKey()"}],
                "unionAll": [{
                    "forEach": "telecom",
                    "column": [{"name": "value", "path": "value"}]
                }, {
                    "forEach": "contact.telecom",
                    "column": [{"name": "value", "path": "value"}]
                }]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "telecom": [{"value": "555-1"}],
            "contact": [{"telecom": [{"value": "555-2"}]}]
        }));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["value"], json!("555-1"));
        assert_eq!(rows[1]["value"], json!("555-2"));
    }

    #[test]
    fn test_union_branch_missing_columns_are_null() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "unionAll": [{
                    "forEach": "telecom",
                    "column": [{"name": "phone", "path": "value"}]
                }, {
                    "forEach": "address",
                    "column": [{"name": "city", "path": "city"}]
                }]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "telecom": [{"value": "555-1"}],
            "address": [{"city": "Springfield"}]
        }));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["phone"], json!("555-1"));
        assert_eq!(rows[0]["city"], Value::Null);
        assert_eq!(rows[1]["phone"], Value::Null);
        assert_eq!(rows[1]["city"], json!("Springfield"));
    }

    #[test]
    fn test_collection_column_keeps_whole_list() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [
                    {"name": "pid", "path": "id"},
                    {"name": "given_names", "path": "name.given", "collection": true}
                ]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "1",
            "name": [{"given": ["Peter", "James"]}, {"given": ["Jim"]}]
        }));
        assert_eq!(rows[0]["given_names"], json!(["Peter", "James", "Jim"]));

        // Empty evaluation maps to null, not an empty list.
        let rows = m.materialize(&json!({"resourceType": "Patient", "id": "2"}));
        assert_eq!(rows[0]["given_names"], Value::Null);
    }

    #[test]
    fn test_resource_key_constant_across_fan_out() {
        let m = materializer(json!({
            "resourceType": "ViewDefinition",
            "name": "v",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "patient_id", "path": "getResourceKey()"}],
                "select": [{
                    "forEach": "name",
                    "column": [{"name": "family", "path": "family"}]
                }]
            }]
        }));

        let rows = m.materialize(&json!({
            "resourceType": "Patient",
            "id": "xyz",
            "name": [{"family": "A"}, {"family": "B"}, {"family": "C"}]
        }));
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row["patient_id"], json!("xyz"));
        }
    }
}
