//! ViewDefinition compilation and row materialization for fhirtab.
//!
//! This crate turns FHIR ViewDefinition resources into compiled plans and
//! applies those plans to individual resources, producing flat rows suitable
//! for relational storage.
//!
//! # Overview
//!
//! A ViewDefinition declares a tabular projection over one FHIR resource
//! type: leaf columns, `forEach` / `forEachOrNull` iteration scopes,
//! `unionAll` branches, `where` filters and named constants. Compilation
//! validates the definition and produces a [`Plan`]; materialization walks
//! the plan's branch tree for each resource and emits rows.
//!
//! # Components
//!
//! - [`ViewDefinition`] - Parsed representation of a ViewDefinition resource
//! - [`compile`] - Validates a ViewDefinition and produces a [`Plan`]
//! - [`FhirPathEngine`] - Evaluates FHIRPath expressions against resources
//! - [`Materializer`] - Applies a plan to one resource, yielding rows
//!
//! # Example
//!
//! ```ignore
//! use fhirtab_view::{compile, Materializer, ViewDefinition};
//!
//! let view = ViewDefinition::parse(&json_text)?;
//! let plan = compile(&view)?;
//! let materializer = Materializer::new(plan.into());
//! let rows = materializer.materialize(&resource);
//! ```

mod compiler;
mod fhirpath;
mod materializer;
mod view_definition;

pub use compiler::{Branch, BranchKind, Plan, PlanColumn, PlanConstant, compile};
pub use fhirpath::FhirPathEngine;
pub use materializer::{MaterializeOutcome, Materializer, Row};
pub use view_definition::{Column, ColumnTag, Constant, Select, ViewDefinition, WhereClause};

use thiserror::Error;

/// Errors that can occur while compiling a ViewDefinition.
#[derive(Debug, Error)]
pub enum Error {
    /// The ViewDefinition is missing a required field or carries an
    /// unusable value in one.
    #[error("Invalid ViewDefinition: field `{field}`: {message}")]
    InvalidViewDefinition {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// A column name does not match the output identifier rule.
    #[error("Invalid column name: `{name}` (must match ^[A-Za-z][A-Za-z0-9_]*$)")]
    InvalidColumnName {
        /// The rejected name.
        name: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
