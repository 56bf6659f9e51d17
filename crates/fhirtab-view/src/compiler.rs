//! ViewDefinition compilation.
//!
//! Compilation validates a [`ViewDefinition`] and resolves it into a
//! [`Plan`]: the declaration-ordered column list used for table creation,
//! the branch tree that drives materialization, the where clauses and the
//! resolved constants. Compilation touches neither files nor the database.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::view_definition::{Column, Select, ViewDefinition};
use crate::{Error, Result};

/// Output column names must be plain identifiers.
static COLUMN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// A compiled, immutable execution plan for one ViewDefinition.
///
/// A plan is created once per view and shared across every resource of the
/// input stream.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The source view's name.
    pub view_name: String,

    /// The FHIR resource type this plan applies to.
    pub resource: String,

    /// Destination table name (lowercased view name).
    pub table_name: String,

    /// All output columns in declaration order, for table creation.
    ///
    /// When `unionAll` branches redeclare a name, the first occurrence
    /// wins; every emitted row carries exactly this column set.
    pub columns: Vec<PlanColumn>,

    /// Ordered branch nodes compiled from the select tree.
    pub branches: Vec<Branch>,

    /// FHIRPath filter expressions; a resource is admitted iff every one
    /// evaluates to a non-empty collection headed by boolean true.
    pub where_clauses: Vec<String>,

    /// Resolved constants, exposed to the evaluator as `%name`.
    pub constants: Vec<PlanConstant>,
}

impl Plan {
    /// Name of the column holding the source resource's `id`, by the
    /// `<resource-lowercased>_id` convention.
    pub fn resource_key_column(&self) -> String {
        format!("{}_id", self.resource.to_lowercase())
    }

    /// Look up a declared column by name.
    pub fn column(&self, name: &str) -> Option<&PlanColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A resolved output column descriptor.
#[derive(Debug, Clone)]
pub struct PlanColumn {
    /// Output column name.
    pub name: String,

    /// FHIRPath expression producing the value.
    pub path: String,

    /// Semantic type (default "string").
    pub col_type: String,

    /// Whether the column keeps the whole evaluation list.
    pub collection: bool,

    /// Human-readable description.
    pub description: Option<String>,

    /// Storage type override carried via an `ansi/type` tag, if any.
    pub ansi_type: Option<String>,

    /// Dotted positional path of the owning select node.
    pub select_path: String,
}

/// A resolved constant.
#[derive(Debug, Clone)]
pub struct PlanConstant {
    /// Constant name, referenced as `%name`.
    pub name: String,

    /// The constant's value.
    pub value: Value,

    /// Lowercased `value[x]` suffix (e.g., "string", "integer").
    pub value_type: String,
}

/// Structural kind of a branch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Plain select: columns evaluated against the current scope.
    Leaf,

    /// Iteration scope with inner-join semantics.
    ForEach,

    /// Iteration scope with outer-join semantics.
    ForEachOrNull,

    /// Alternative branches whose rows are concatenated.
    Union,
}

/// One node of the compiled branch tree.
///
/// Leaf branches carry no iteration expression; `forEach`/`forEachOrNull`
/// branches carry exactly one; union branches aggregate their children as
/// alternatives and own no columns of their own.
#[derive(Debug, Clone)]
pub struct Branch {
    /// Dotted positional index path from the root select list.
    pub select_path: String,

    /// Structural kind.
    pub kind: BranchKind,

    /// Iteration scope expression for `forEach`/`forEachOrNull` branches.
    pub iter_expression: Option<String>,

    /// Columns owned by this node.
    pub columns: Vec<PlanColumn>,

    /// Child branches, in textual order.
    pub children: Vec<Branch>,
}

impl Branch {
    /// Collect the names of every column in this branch's subtree.
    pub fn subtree_column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        for child in &self.children {
            names.extend(child.subtree_column_names());
        }
        names
    }
}

/// Compile a ViewDefinition into an immutable [`Plan`].
///
/// # Errors
///
/// Returns [`Error::InvalidViewDefinition`] when a required field is
/// missing or unusable, and [`Error::InvalidColumnName`] when a column name
/// is not a plain identifier. Either is fatal for the view.
pub fn compile(view: &ViewDefinition) -> Result<Plan> {
    require(&view.name, "name")?;
    require(&view.status, "status")?;
    require(&view.resource, "resource")?;

    if view.select.is_empty() {
        return Err(Error::InvalidViewDefinition {
            field: "select",
            message: "must be a non-empty sequence".to_string(),
        });
    }

    let mut plan = Plan {
        view_name: view.name.clone(),
        resource: view.resource.clone(),
        table_name: view.name.to_lowercase(),
        columns: Vec::new(),
        branches: Vec::new(),
        where_clauses: view.where_.iter().map(|w| w.path.clone()).collect(),
        constants: Vec::new(),
    };

    for (index, select) in view.select.iter().enumerate() {
        let branch = compile_select(select, index.to_string(), &mut plan.columns)?;
        plan.branches.push(branch);
    }

    for constant in &view.constant {
        let (value, value_type) =
            constant
                .value_entry()
                .ok_or_else(|| Error::InvalidViewDefinition {
                    field: "constant",
                    message: format!("constant `{}` carries no value[x] attribute", constant.name),
                })?;
        plan.constants.push(PlanConstant {
            name: constant.name.clone(),
            value,
            value_type,
        });
    }

    Ok(plan)
}

fn require(value: &str, field: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidViewDefinition {
            field,
            message: "missing required field".to_string(),
        });
    }
    Ok(())
}

/// Recursive descent over one select node.
///
/// Columns are validated and appended to the plan's declaration-order list
/// (first occurrence of a name wins); the node and its nested selects and
/// union branches become the returned branch subtree.
fn compile_select(
    select: &Select,
    select_path: String,
    declared: &mut Vec<PlanColumn>,
) -> Result<Branch> {
    let (kind, iter_expression) = match (&select.for_each, &select.for_each_or_null) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidViewDefinition {
                field: "forEach",
                message: format!(
                    "select `{select_path}` declares both forEach and forEachOrNull"
                ),
            });
        }
        (Some(expr), None) => (BranchKind::ForEach, Some(expr.clone())),
        (None, Some(expr)) => (BranchKind::ForEachOrNull, Some(expr.clone())),
        (None, None) => (BranchKind::Leaf, None),
    };

    let mut columns = Vec::with_capacity(select.column.len());
    for column in &select.column {
        let compiled = compile_column(column, &select_path)?;
        if !declared.iter().any(|c| c.name == compiled.name) {
            declared.push(compiled.clone());
        }
        columns.push(compiled);
    }

    let mut children = Vec::new();
    for (index, nested) in select.select.iter().enumerate() {
        children.push(compile_select(
            nested,
            format!("{select_path}.{index}"),
            declared,
        )?);
    }

    if let Some(union) = &select.union_all {
        let union_path = format!("{select_path}.union");
        let mut alternatives = Vec::with_capacity(union.len());
        for (index, alternative) in union.iter().enumerate() {
            alternatives.push(compile_select(
                alternative,
                format!("{union_path}.{index}"),
                declared,
            )?);
        }
        children.push(Branch {
            select_path: union_path,
            kind: BranchKind::Union,
            iter_expression: None,
            columns: Vec::new(),
            children: alternatives,
        });
    }

    Ok(Branch {
        select_path,
        kind,
        iter_expression,
        columns,
        children,
    })
}

fn compile_column(column: &Column, select_path: &str) -> Result<PlanColumn> {
    if !COLUMN_NAME_RE.is_match(&column.name) {
        return Err(Error::InvalidColumnName {
            name: column.name.clone(),
        });
    }

    let ansi_type = column
        .tag
        .iter()
        .find(|t| t.name == "ansi/type")
        .map(|t| t.value.clone());

    Ok(PlanColumn {
        name: column.name.clone(),
        path: column.path.clone(),
        col_type: column
            .col_type
            .clone()
            .unwrap_or_else(|| "string".to_string()),
        collection: column.collection.unwrap_or(false),
        description: column.description.clone(),
        ansi_type,
        select_path: select_path.to_string(),
    })
}
