//! ViewDefinition parsing and types.
//!
//! This module defines the data structures for parsing FHIR ViewDefinition
//! resources as specified in the SQL on FHIR Implementation Guide. Unknown
//! fields are ignored on input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// A ViewDefinition resource that defines a tabular view over FHIR data.
///
/// ViewDefinitions specify how to transform FHIR resources into flat,
/// tabular data suitable for relational storage and analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    /// Human-readable name for the view; doubles as the destination table
    /// name (lowercased).
    #[serde(default)]
    pub name: String,

    /// Publication status: draft | active | retired | unknown.
    #[serde(default)]
    pub status: String,

    /// The FHIR resource type this view is based on (e.g., "Patient").
    #[serde(default)]
    pub resource: String,

    /// Description of the view's purpose.
    pub description: Option<String>,

    /// The columns and nested selects to include in the view.
    #[serde(default)]
    pub select: Vec<Select>,

    /// Filter conditions to apply to the view.
    /// Note: Named `where_` because `where` is a Rust reserved keyword.
    #[serde(default, rename = "where")]
    pub where_: Vec<WhereClause>,

    /// Constants that can be referenced in FHIRPath expressions as `%name`.
    #[serde(default)]
    pub constant: Vec<Constant>,
}

/// A select clause that defines columns or nested structures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Select {
    /// Column definitions at this level.
    #[serde(default)]
    pub column: Vec<Column>,

    /// FHIRPath expression for array expansion (one row per element;
    /// inner-join semantics).
    pub for_each: Option<String>,

    /// Like forEach, but emits a row with nulls when the expression
    /// produces nothing (outer-join semantics).
    pub for_each_or_null: Option<String>,

    /// Nested select clauses.
    #[serde(default)]
    pub select: Vec<Select>,

    /// Alternative select branches merged vertically.
    pub union_all: Option<Vec<Select>>,
}

/// A column definition in a ViewDefinition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// The column name in the output.
    pub name: String,

    /// FHIRPath expression to extract the column value.
    pub path: String,

    /// Expected semantic type of the column (default "string").
    #[serde(rename = "type")]
    pub col_type: Option<String>,

    /// Whether this column holds the full evaluation list rather than its
    /// first element.
    pub collection: Option<bool>,

    /// Human-readable description of the column.
    pub description: Option<String>,

    /// Additional metadata tags (e.g., an `ansi/type` storage override).
    #[serde(default)]
    pub tag: Vec<ColumnTag>,
}

/// A metadata tag attached to a column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnTag {
    /// Tag name (e.g., "ansi/type").
    pub name: String,

    /// Tag value.
    pub value: String,
}

/// A where clause for filtering resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhereClause {
    /// FHIRPath expression that must evaluate to true for the resource to
    /// be admitted.
    pub path: String,

    /// Human-readable description of the filter.
    pub description: Option<String>,
}

/// A constant value that can be referenced in FHIRPath expressions.
///
/// The value is carried in a `value[x]` choice attribute (`valueString`,
/// `valueInteger`, `valueBoolean`, ...); any attribute whose name begins
/// with `value` is recognized, and the remainder of the attribute name is
/// the constant's type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constant {
    /// Name of the constant (referenced as %name in FHIRPath).
    pub name: String,

    /// The `value[x]` choice attribute, keyed by its full attribute name.
    #[serde(flatten)]
    pub value: BTreeMap<String, Value>,
}

impl Constant {
    /// Resolve the `value[x]` attribute into `(value, type)` where the type
    /// is the lowercased attribute suffix (e.g., `valueString` -> "string").
    ///
    /// Returns `None` when no `value*` attribute is present.
    pub fn value_entry(&self) -> Option<(Value, String)> {
        self.value.iter().find_map(|(key, value)| {
            key.strip_prefix("value")
                .map(|suffix| (value.clone(), suffix.to_lowercase()))
        })
    }
}

impl ViewDefinition {
    /// Parse a ViewDefinition from a JSON Value.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a valid ViewDefinition.
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidViewDefinition {
            field: "select",
            message: e.to_string(),
        })
    }

    /// Parse a ViewDefinition from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or not a valid
    /// ViewDefinition.
    pub fn parse(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(|e| Error::InvalidViewDefinition {
            field: "select",
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_view_definition() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "patient_demographics",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{
                    "name": "id",
                    "path": "id"
                }, {
                    "name": "gender",
                    "path": "gender"
                }]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.name, "patient_demographics");
        assert_eq!(view.resource, "Patient");
        assert_eq!(view.select.len(), 1);

        let columns = &view.select[0].column;
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[1].name, "gender");
    }

    #[test]
    fn test_parse_view_with_foreach() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "patient_names",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "forEach": "name",
                "column": [{
                    "name": "family",
                    "path": "family"
                }, {
                    "name": "given",
                    "path": "given.first()"
                }]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.select[0].for_each, Some("name".to_string()));
    }

    #[test]
    fn test_parse_view_with_where() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "active_patients",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{
                    "name": "id",
                    "path": "id"
                }]
            }],
            "where": [{
                "path": "active = true"
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.where_.len(), 1);
        assert_eq!(view.where_[0].path, "active = true");
    }

    #[test]
    fn test_parse_view_with_union_all() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "patient_contact_points",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "unionAll": [{
                    "forEach": "telecom",
                    "column": [{"name": "value", "path": "value"}]
                }, {
                    "forEach": "contact.telecom",
                    "column": [{"name": "value", "path": "value"}]
                }]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        let union = view.select[0].union_all.as_ref().unwrap();
        assert_eq!(union.len(), 2);
        assert_eq!(union[0].for_each, Some("telecom".to_string()));
    }

    #[test]
    fn test_constant_value_entry() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "test_view",
            "status": "active",
            "resource": "Patient",
            "constant": [{
                "name": "statusFilter",
                "valueString": "active"
            }, {
                "name": "maxAge",
                "valueInteger": 65
            }, {
                "name": "threshold",
                "valueDecimal": 2.5
            }],
            "select": [{
                "column": [{"name": "id", "path": "id"}]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.constant.len(), 3);

        let (value, ty) = view.constant[0].value_entry().unwrap();
        assert_eq!(value, json!("active"));
        assert_eq!(ty, "string");

        let (value, ty) = view.constant[1].value_entry().unwrap();
        assert_eq!(value, json!(65));
        assert_eq!(ty, "integer");

        let (value, ty) = view.constant[2].value_entry().unwrap();
        assert_eq!(value, json!(2.5));
        assert_eq!(ty, "decimal");
    }

    #[test]
    fn test_constant_without_value() {
        let constant = Constant {
            name: "empty".to_string(),
            value: BTreeMap::new(),
        };
        assert!(constant.value_entry().is_none());
    }

    #[test]
    fn test_column_tags() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "tagged_view",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{
                    "name": "raw_name",
                    "path": "name",
                    "collection": true,
                    "tag": [{"name": "ansi/type", "value": "JSON"}]
                }]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        let col = &view.select[0].column[0];
        assert_eq!(col.collection, Some(true));
        assert_eq!(col.tag[0].name, "ansi/type");
        assert_eq!(col.tag[0].value, "JSON");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "url": "http://example.org/views/demo",
            "experimental": true,
            "name": "demo",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{"name": "id", "path": "id"}]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.name, "demo");
    }
}
