//! Query plans, optimization and the queryable frontend
//!
//! A query is a tree of plan nodes over a record stream. The frontend
//! ([`Queryable`]) compiles predicate specifications into expression trees,
//! and the optimizer rewrites the plan (predicate pushdown, index
//! selection, AND/OR merge) before pull-based execution streams records
//! through it one at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod expr;
pub mod optimizer;
pub mod plan;
pub mod queryable;
pub mod traverse;

pub use context::{QueryContext, Row};
pub use expr::{Expression, FieldPath, FilterSpec, Operator, Term};
pub use optimizer::{optimize, OptimizerConfig};
pub use plan::{
    AndMergePlan, Filter, FromPlan, IndexedRangeSearchPlan, IndexedSearchPlan, ListPlan,
    OrMergePlan, Plan, Projection, RowStream, SelectPlan, WherePlan,
};
pub use queryable::{from_collection, Grouping, OnUnsupported, Policy, Queryable};
pub use traverse::{traverse, Direction, Strategy, TraverseOptions};
