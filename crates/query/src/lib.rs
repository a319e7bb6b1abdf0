//! Hybrid query planner and executor.
//!
//! The input is a normalised plan tree (the text surface parses and binds
//! elsewhere): conjunctive scalar filters, at most one spatial predicate,
//! at most one vector scorer, order/limit, an optional cursor anchor and
//! hints. The planner costs `CompositeFirst` / `SpatialFirst` /
//! `VectorFirst` / `FullScan` from live probes and picks by the fixed rule
//! chain; the executor drives index cursors, pushes whitelists into ANN,
//! reranks overfetched candidates and paginates with `limit + 1`.

pub mod executor;
pub mod plan;
pub mod planner;

pub use executor::execute;
pub use plan::{
    Cursor, FieldFilter, FilterOp, OrderBy, PlanKind, Query, QueryOptions, QueryResult, Row,
    SpatialPredicate, VectorScorer,
};
pub use planner::{plan_query, PlanChoice, PlanCosts};
