//! Plan nodes and pull-based execution.
//!
//! Every node exposes `execute` (a lazy stream of rows) and `count`.
//! Records flow up the tree one at a time; cancellation is checked at node
//! boundaries and periodically inside streams.

use crate::context::{QueryContext, Row};
use crate::expr::{Expression, FieldPath, FilterSpec};
use atomdb_collections::atom_ref::RefIdentity;
use atomdb_collections::{AtomSource, List, RepeatedKeysDictionary, Set};
use atomdb_core::{CancellationToken, Error, Result, Value};
use atomdb_executor::parallel_scan;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A lazy stream of rows.
pub type RowStream = Box<dyn Iterator<Item = Result<Row>>>;

/// Predicate closure form accepted by [`WherePlan`].
pub type RowPredicate = Arc<dyn Fn(&Row, &dyn AtomSource) -> Result<bool> + Send + Sync>;

/// Computed projection closure form accepted by [`SelectPlan`].
pub type RowProjection = Arc<dyn Fn(&Row, &dyn AtomSource) -> Result<Value> + Send + Sync>;

/// Full scans switch to the parallel pool above this many rows.
const PARALLEL_SCAN_THRESHOLD: usize = 1024;

/// How often streaming adapters poll the cancellation token.
const CANCEL_CHECK_INTERVAL: usize = 64;

fn guarded(inner: RowStream, token: CancellationToken) -> RowStream {
    struct Guarded {
        inner: RowStream,
        token: CancellationToken,
        emitted: usize,
        failed: bool,
    }
    impl Iterator for Guarded {
        type Item = Result<Row>;
        fn next(&mut self) -> Option<Self::Item> {
            if self.failed {
                return None;
            }
            if self.emitted % CANCEL_CHECK_INTERVAL == 0 {
                if let Err(e) = self.token.check() {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            self.emitted += 1;
            self.inner.next()
        }
    }
    Box::new(Guarded {
        inner,
        token,
        emitted: 0,
        failed: false,
    })
}

/// A query plan: a tree of nodes over a record stream.
#[derive(Clone)]
pub enum Plan {
    /// Records from a plain sequence; no indexes.
    List(ListPlan),
    /// Anchors the stream, its alias and the index map.
    From(FromPlan),
    /// Filters records.
    Where(WherePlan),
    /// Projects records.
    Select(SelectPlan),
    /// Equality / IN lookup through an index.
    IndexedSearch(IndexedSearchPlan),
    /// Bounded scan through an ordered index.
    IndexedRange(IndexedRangeSearchPlan),
    /// Set-intersection of indexed subplans.
    AndMerge(AndMergePlan),
    /// Set-union of indexed subplans with deduplication.
    OrMerge(OrMergePlan),
}

/// Source of a [`ListPlan`].
#[derive(Clone)]
pub enum ListSource {
    /// Already materialized rows.
    Rows(Arc<Vec<Row>>),
    /// Members of a persistent set.
    Set(Set),
    /// Elements of a persistent list.
    Seq(List),
}

/// Records from a plain sequence.
#[derive(Clone)]
pub struct ListPlan {
    /// Where the rows come from.
    pub source: ListSource,
}

impl ListPlan {
    /// Plan over materialized rows.
    pub fn from_rows(rows: Vec<Row>) -> ListPlan {
        ListPlan {
            source: ListSource::Rows(Arc::new(rows)),
        }
    }

    /// Plan over the members of a set.
    pub fn from_set(set: Set) -> ListPlan {
        ListPlan {
            source: ListSource::Set(set),
        }
    }

    /// Plan over the elements of a list.
    pub fn from_list(list: List) -> ListPlan {
        ListPlan {
            source: ListSource::Seq(list),
        }
    }

    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        let stream: RowStream = match &self.source {
            ListSource::Rows(rows) => {
                let rows = rows.clone();
                Box::new((0..rows.len()).map(move |i| Ok(rows[i].clone())))
            }
            ListSource::Set(set) => Box::new(
                set.iter(ctx.source().clone())
                    .map(|r| r.map(Row::new)),
            ),
            ListSource::Seq(list) => Box::new(
                list.iter(ctx.source().clone())
                    .map(|r| r.map(Row::new)),
            ),
        };
        Ok(stream)
    }

    fn count(&self) -> u64 {
        match &self.source {
            ListSource::Rows(rows) => rows.len() as u64,
            ListSource::Set(set) => set.count(),
            ListSource::Seq(list) => list.count(),
        }
    }

    /// Rows when already materialized.
    pub fn materialized(&self) -> Option<&Arc<Vec<Row>>> {
        match &self.source {
            ListSource::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Anchors the record stream and its alias for attribute resolution.
#[derive(Clone)]
pub struct FromPlan {
    /// Alias that attribute paths must use.
    pub alias: String,
    /// The underlying record source.
    pub based_on: Box<Plan>,
    /// Registered indexes, keyed by alias-prefixed field path.
    pub indexes: Arc<BTreeMap<String, RepeatedKeysDictionary>>,
}

impl FromPlan {
    /// Wrap a base plan under an alias with an index map.
    pub fn new(
        alias: impl Into<String>,
        based_on: Plan,
        indexes: BTreeMap<String, RepeatedKeysDictionary>,
    ) -> FromPlan {
        FromPlan {
            alias: alias.into(),
            based_on: Box::new(based_on),
            indexes: Arc::new(indexes),
        }
    }
}

/// Filter carried by a [`WherePlan`].
#[derive(Clone)]
pub enum Filter {
    /// Token tree awaiting compilation.
    Spec(FilterSpec),
    /// Compiled expression tree.
    Compiled(Arc<Expression>),
    /// Opaque predicate closure; never indexable.
    Predicate(RowPredicate),
}

impl Filter {
    fn matches(&self, row: &Row, src: &dyn AtomSource) -> Result<bool> {
        match self {
            Filter::Spec(spec) => Expression::compile(spec)?.matches(row, src),
            Filter::Compiled(e) => e.matches(row, src),
            Filter::Predicate(f) => f(row, src),
        }
    }
}

/// Filters records.
#[derive(Clone)]
pub struct WherePlan {
    /// The predicate.
    pub filter: Filter,
    /// The filtered stream.
    pub based_on: Box<Plan>,
}

impl WherePlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        // A full scan over a large materialized base may fan out.
        if let (Some(config), Plan::List(list)) = (ctx.parallel(), &*self.based_on) {
            if let Some(rows) = list.materialized() {
                if rows.len() >= PARALLEL_SCAN_THRESHOLD {
                    let total = rows.len();
                    let rows = rows.clone();
                    let filter = self.filter.clone();
                    let source = ctx.source().clone();
                    let fetch = move |offset: usize, count: usize| -> Vec<Row> {
                        rows[offset..(offset + count).min(rows.len())].to_vec()
                    };
                    let process = move |row: Row| -> Option<Result<Row>> {
                        match filter.matches(&row, &*source) {
                            Ok(true) => Some(Ok(row)),
                            Ok(false) => None,
                            Err(e) => Some(Err(e)),
                        }
                    };
                    let out = parallel_scan(total, fetch, process, config, ctx.token())?;
                    return Ok(Box::new(out.into_iter()));
                }
            }
        }

        let inner = self.based_on.execute(ctx)?;
        let filter = self.filter.clone();
        let source = ctx.source().clone();
        let stream = inner.filter_map(move |item| match item {
            Err(e) => Some(Err(e)),
            Ok(row) => match filter.matches(&row, &*source) {
                Ok(true) => Some(Ok(row)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            },
        });
        Ok(guarded(Box::new(stream), ctx.token().clone()))
    }
}

/// One output field of a [`SelectPlan`].
#[derive(Clone)]
pub enum Projection {
    /// Copy the attribute at a path (references included).
    Path(FieldPath),
    /// Compute a scalar from the row.
    Computed(RowProjection),
}

/// Projects records into new records with the selected fields.
#[derive(Clone)]
pub struct SelectPlan {
    /// Output name to projection, in declaration order.
    pub fields: Arc<Vec<(String, Projection)>>,
    /// The projected stream.
    pub based_on: Box<Plan>,
}

impl SelectPlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        let inner = self.based_on.execute(ctx)?;
        let fields = self.fields.clone();
        let source = ctx.source().clone();
        let stream = inner.map(move |item| {
            let row = item?;
            let mut out = atomdb_collections::Record::new();
            for (name, projection) in fields.iter() {
                out = match projection {
                    Projection::Path(path) => match row.field(path, &*source)? {
                        Some(field) => out.set(name, field)?,
                        None => out.set(name, Value::Null)?,
                    },
                    Projection::Computed(f) => out.set(name, f(&row, &*source)?)?,
                };
            }
            Ok(Row::from_record(out))
        });
        Ok(guarded(Box::new(stream), ctx.token().clone()))
    }
}

/// Equality or IN lookup through a registered index.
#[derive(Clone)]
pub struct IndexedSearchPlan {
    /// Alias-prefixed field the index covers.
    pub field: String,
    /// Keys to look up; one for equality, several for IN.
    pub keys: Arc<Vec<Value>>,
    /// The index itself.
    pub index: RepeatedKeysDictionary,
}

impl IndexedSearchPlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        let src = ctx.source();
        let mut out: Vec<Row> = Vec::new();
        for key in self.keys.iter() {
            if let Some(slot) = self.index.get_at(key, &**src)? {
                for member in slot.members(&**src)? {
                    out.push(Row::new(member));
                }
            }
        }
        Ok(guarded(Box::new(out.into_iter().map(Ok)), ctx.token().clone()))
    }

    fn count(&self, ctx: &QueryContext) -> Result<u64> {
        let src = ctx.source();
        let mut total = 0;
        for key in self.keys.iter() {
            if let Some(slot) = self.index.get_at(key, &**src)? {
                total += slot.count();
            }
        }
        Ok(total)
    }
}

/// Bounded scan through an ordered index.
#[derive(Clone)]
pub struct IndexedRangeSearchPlan {
    /// Alias-prefixed field the index covers.
    pub field: String,
    /// Lower bound, open when `None`.
    pub lo: Option<Value>,
    /// Upper bound, open when `None`.
    pub hi: Option<Value>,
    /// Bound inclusivity `(low, high)`.
    pub inclusive: (bool, bool),
    /// The index itself.
    pub index: RepeatedKeysDictionary,
}

impl IndexedRangeSearchPlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        let src = ctx.source().clone();
        let iter = self
            .index
            .range(self.lo.clone(), self.hi.clone(), self.inclusive, src.clone());
        let stream = iter.flat_map(move |item| -> Vec<Result<Row>> {
            match item {
                Err(e) => vec![Err(e)],
                Ok((_, slot)) => match slot.members(&*src) {
                    Err(e) => vec![Err(e)],
                    Ok(members) => members.into_iter().map(|m| Ok(Row::new(m))).collect(),
                },
            }
        });
        Ok(guarded(Box::new(stream), ctx.token().clone()))
    }

    fn count(&self, ctx: &QueryContext) -> Result<u64> {
        let src = ctx.source().clone();
        let mut total = 0;
        for item in self
            .index
            .range(self.lo.clone(), self.hi.clone(), self.inclusive, src)
        {
            let (_, slot) = item?;
            total += slot.count();
        }
        Ok(total)
    }
}

/// Set-intersection of indexed subplans.
///
/// The child with the smallest estimated cardinality streams; the others
/// are materialized into identity sets and probed.
#[derive(Clone)]
pub struct AndMergePlan {
    /// Indexed subplans to intersect.
    pub children: Vec<Plan>,
}

impl AndMergePlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        if self.children.is_empty() {
            return Err(Error::not_supported("AndMerge requires at least one child"));
        }
        let mut order: Vec<(u64, usize)> = Vec::with_capacity(self.children.len());
        for (i, child) in self.children.iter().enumerate() {
            order.push((child.count(ctx)?, i));
        }
        order.sort();
        let (_, smallest) = order[0];

        let mut probes: Vec<FxHashSet<RefIdentity>> = Vec::new();
        for &(_, idx) in order.iter().skip(1) {
            let mut set = FxHashSet::default();
            for item in self.children[idx].execute(ctx)? {
                set.insert(item?.identity());
            }
            probes.push(set);
        }

        let inner = self.children[smallest].execute(ctx)?;
        let mut seen = FxHashSet::default();
        let stream = inner.filter_map(move |item| match item {
            Err(e) => Some(Err(e)),
            Ok(row) => {
                let id = row.identity();
                if !seen.insert(id) {
                    return None;
                }
                if probes.iter().all(|p| p.contains(&id)) {
                    Some(Ok(row))
                } else {
                    None
                }
            }
        });
        Ok(guarded(Box::new(stream), ctx.token().clone()))
    }
}

/// Set-union of subplans with record-identity deduplication.
#[derive(Clone)]
pub struct OrMergePlan {
    /// Subplans to union.
    pub children: Vec<Plan>,
}

impl OrMergePlan {
    fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        let mut streams = Vec::with_capacity(self.children.len());
        for child in &self.children {
            streams.push(child.execute(ctx)?);
        }
        let mut seen: FxHashSet<RefIdentity> = FxHashSet::default();
        let stream = streams
            .into_iter()
            .flatten()
            .filter_map(move |item| match item {
                Err(e) => Some(Err(e)),
                Ok(row) => {
                    if seen.insert(row.identity()) {
                        Some(Ok(row))
                    } else {
                        None
                    }
                }
            });
        Ok(guarded(Box::new(stream), ctx.token().clone()))
    }
}

impl Plan {
    /// Execute the plan, producing a lazy stream of rows.
    pub fn execute(&self, ctx: &QueryContext) -> Result<RowStream> {
        ctx.token().check()?;
        match self {
            Plan::List(p) => p.execute(ctx),
            Plan::From(p) => p.based_on.execute(ctx),
            Plan::Where(p) => p.execute(ctx),
            Plan::Select(p) => p.execute(ctx),
            Plan::IndexedSearch(p) => p.execute(ctx),
            Plan::IndexedRange(p) => p.execute(ctx),
            Plan::AndMerge(p) => p.execute(ctx),
            Plan::OrMerge(p) => p.execute(ctx),
        }
    }

    /// Number of records the plan produces.
    ///
    /// Index-backed nodes answer from slot counts; everything else drains
    /// its stream.
    pub fn count(&self, ctx: &QueryContext) -> Result<u64> {
        match self {
            Plan::List(p) => Ok(p.count()),
            Plan::From(p) => p.based_on.count(ctx),
            Plan::IndexedSearch(p) => p.count(ctx),
            Plan::IndexedRange(p) => p.count(ctx),
            _ => {
                let mut n = 0;
                for item in self.execute(ctx)? {
                    item?;
                    n += 1;
                }
                Ok(n)
            }
        }
    }

    /// Node name used by `explain`.
    pub fn node_name(&self) -> &'static str {
        match self {
            Plan::List(_) => "ListPlan",
            Plan::From(_) => "FromPlan",
            Plan::Where(_) => "WherePlan",
            Plan::Select(_) => "SelectPlan",
            Plan::IndexedSearch(_) => "IndexedSearchPlan",
            Plan::IndexedRange(_) => "IndexedRangeSearchPlan",
            Plan::AndMerge(_) => "AndMerge",
            Plan::OrMerge(_) => "OrMerge",
        }
    }

    /// The nearest from-plan alias and index map below this node, if any.
    pub fn from_context(&self) -> Option<(&str, &Arc<BTreeMap<String, RepeatedKeysDictionary>>)> {
        match self {
            Plan::From(p) => Some((&p.alias, &p.indexes)),
            Plan::Where(p) => p.based_on.from_context(),
            Plan::Select(p) => p.based_on.from_context(),
            _ => None,
        }
    }
}

/// Collect a stream into rows, failing on the first error.
pub fn drain(stream: RowStream) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    for item in stream {
        out.push(item?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_collections::{NullSource, Record};
    use std::time::Duration;

    fn rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                Row::from_record(
                    Record::new()
                        .set("n", Value::Int(i))
                        .unwrap()
                        .set("parity", Value::Int(i % 2))
                        .unwrap(),
                )
            })
            .collect()
    }

    fn ctx() -> QueryContext {
        QueryContext::new(Arc::new(NullSource))
    }

    fn where_spec(spec: FilterSpec, base: Plan) -> Plan {
        Plan::Where(WherePlan {
            filter: Filter::Compiled(Arc::new(Expression::compile(&spec).unwrap())),
            based_on: Box::new(base),
        })
    }

    #[test]
    fn test_list_plan_streams_rows() {
        let plan = Plan::List(ListPlan::from_rows(rows(5)));
        assert_eq!(plan.count(&ctx()).unwrap(), 5);
        let out = drain(plan.execute(&ctx()).unwrap()).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_where_filters() {
        let base = Plan::List(ListPlan::from_rows(rows(10)));
        let plan = where_spec(FilterSpec::cmp("r.parity", "==", 0), base);
        let out = drain(plan.execute(&ctx()).unwrap()).unwrap();
        assert_eq!(out.len(), 5);
        let path = FieldPath::parse("r.n").unwrap();
        for row in out {
            match row.value(&path, &NullSource).unwrap() {
                Value::Int(n) => assert_eq!(n % 2, 0),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_select_projects() {
        let base = Plan::List(ListPlan::from_rows(rows(3)));
        let plan = Plan::Select(SelectPlan {
            fields: Arc::new(vec![(
                "double".to_string(),
                Projection::Computed(Arc::new(|row, src| {
                    let path = FieldPath::parse("r.n").unwrap();
                    Ok(match row.value(&path, src)? {
                        Value::Int(n) => Value::Int(n * 2),
                        _ => Value::Null,
                    })
                })),
            )]),
            based_on: Box::new(base),
        });
        let out = drain(plan.execute(&ctx()).unwrap()).unwrap();
        let path = FieldPath::parse("r.double").unwrap();
        let values: Vec<Value> = out
            .iter()
            .map(|r| r.value(&path, &NullSource).unwrap())
            .collect();
        assert_eq!(values, vec![Value::Int(0), Value::Int(2), Value::Int(4)]);
    }

    #[test]
    fn test_cancelled_execution_stops() {
        let token = CancellationToken::with_deadline(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        let ctx = QueryContext::new(Arc::new(NullSource)).with_token(token);
        let plan = Plan::List(ListPlan::from_rows(rows(10)));
        assert!(plan.execute(&ctx).is_err());
    }

    #[test]
    fn test_or_merge_deduplicates() {
        let shared = rows(4);
        let a = Plan::List(ListPlan::from_rows(shared.clone()));
        let b = Plan::List(ListPlan::from_rows(shared));
        let plan = Plan::OrMerge(OrMergePlan { children: vec![a, b] });
        let out = drain(plan.execute(&ctx()).unwrap()).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_parallel_where_matches_sequential() {
        let many = rows(4096);
        let spec = FilterSpec::cmp("r.parity", "==", 1);
        let base = Plan::List(ListPlan::from_rows(many));

        let sequential = drain(
            where_spec(spec.clone(), base.clone())
                .execute(&ctx())
                .unwrap(),
        )
        .unwrap();
        let par_ctx = ctx().with_parallel(atomdb_executor::ParallelConfig::for_testing(4));
        let parallel = drain(where_spec(spec, base).execute(&par_ctx).unwrap()).unwrap();

        assert_eq!(sequential.len(), 2048);
        assert_eq!(parallel.len(), sequential.len());
    }
}
