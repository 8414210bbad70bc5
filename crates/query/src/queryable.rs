//! The queryable frontend: a fluent pipeline over plans.
//!
//! A [`Queryable`] records operators lazily. At execution the leading run
//! of `where`/`select` operators is translated into a plan chain and handed
//! to the optimizer; whatever follows (ordering, pagination, traversal,
//! grouping) executes locally under the policy limits.

use crate::context::{QueryContext, Row};
use crate::expr::{Expression, FieldPath, FilterSpec};
use crate::optimizer::{optimize, OptimizerConfig};
use crate::plan::{
    drain, Filter, FromPlan, ListPlan, Plan, Projection, RowPredicate, SelectPlan, WherePlan,
};
use crate::traverse::{traverse, TraverseOptions};
use atomdb_collections::{AtomSource, List, RepeatedKeysDictionary, Set};
use atomdb_core::{Error, Result, Value};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default alias used when wrapping a bare collection.
pub const DEFAULT_ALIAS: &str = "r";

/// What to do when an operator cannot be pushed into the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnUnsupported {
    /// Fail the query.
    Error,
    /// Log a warning and evaluate locally.
    Warn,
    /// Silently evaluate locally.
    Fallback,
}

/// Execution policy for queryable pipelines.
///
/// The limits apply to the locally evaluated part of the pipeline.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Reaction to operators that cannot use the plan engine.
    pub on_unsupported: OnUnsupported,
    /// Hard cap on locally materialized rows.
    pub max_rows_local: usize,
    /// Wall-clock budget for local evaluation.
    pub timeout: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            on_unsupported: OnUnsupported::Fallback,
            max_rows_local: 100_000,
            timeout: None,
        }
    }
}

/// Sort / grouping key: an attribute path or a computed function.
#[derive(Clone)]
pub enum KeySpec {
    /// The scalar at an attribute path.
    Path(FieldPath),
    /// A computed scalar.
    Computed(Arc<dyn Fn(&Row, &dyn AtomSource) -> Result<Value> + Send + Sync>),
}

impl KeySpec {
    /// Key from an alias-prefixed attribute.
    pub fn path(attr: &str) -> Result<KeySpec> {
        Ok(KeySpec::Path(FieldPath::parse(attr)?))
    }

    fn eval(&self, row: &Row, src: &dyn AtomSource) -> Result<Value> {
        match self {
            KeySpec::Path(p) => row.value(p, src),
            KeySpec::Computed(f) => f(row, src),
        }
    }
}

#[derive(Clone)]
enum Op {
    Where(FilterSpec),
    WhereFn(RowPredicate),
    Select(Vec<(String, Projection)>),
    SelectMany(FieldPath),
    OrderBy {
        key: KeySpec,
        ascending: bool,
        nulls_last: bool,
    },
    Distinct(Option<KeySpec>),
    Take(usize),
    Skip(usize),
    Traverse {
        attr: String,
        options: TraverseOptions,
    },
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Where(_) | Op::WhereFn(_) => "where",
            Op::Select(_) => "select",
            Op::SelectMany(_) => "select_many",
            Op::OrderBy { .. } => "order_by",
            Op::Distinct(_) => "distinct",
            Op::Take(_) => "take",
            Op::Skip(_) => "skip",
            Op::Traverse { .. } => "traverse",
        }
    }
}

/// One group produced by `group_by`.
pub struct Grouping {
    /// The grouping key.
    pub key: Value,
    /// Rows sharing the key, in stream order.
    pub rows: Vec<Row>,
}

impl Grouping {
    /// Number of rows in the group.
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    /// Sum of a numeric attribute across the group.
    pub fn sum_by(&self, attr: &str, src: &dyn AtomSource) -> Result<f64> {
        let path = FieldPath::parse(attr)?;
        let mut total = 0.0;
        for row in &self.rows {
            total += match row.value(&path, src)? {
                Value::Int(i) => i as f64,
                Value::Float(f) => f,
                _ => 0.0,
            };
        }
        Ok(total)
    }

    /// Mean of a numeric attribute across the group (0 when empty).
    pub fn average_by(&self, attr: &str, src: &dyn AtomSource) -> Result<f64> {
        if self.rows.is_empty() {
            return Ok(0.0);
        }
        Ok(self.sum_by(attr, src)? / self.rows.len() as f64)
    }
}

/// Entry point: build a queryable from a plan.
pub fn from_collection(plan: Plan, ctx: QueryContext) -> Queryable {
    Queryable {
        base: plan,
        ops: Vec::new(),
        ctx,
        policy: Policy::default(),
    }
}

/// A lazily composed query pipeline.
#[derive(Clone)]
pub struct Queryable {
    base: Plan,
    ops: Vec<Op>,
    ctx: QueryContext,
    policy: Policy,
}

impl Queryable {
    /// Queryable over the members of a set.
    pub fn from_set(set: Set, ctx: QueryContext) -> Queryable {
        from_collection(Plan::List(ListPlan::from_set(set)), ctx)
    }

    /// Queryable over the elements of a list.
    pub fn from_list(list: List, ctx: QueryContext) -> Queryable {
        from_collection(Plan::List(ListPlan::from_list(list)), ctx)
    }

    /// Queryable over materialized rows.
    pub fn from_rows(rows: Vec<Row>, ctx: QueryContext) -> Queryable {
        from_collection(Plan::List(ListPlan::from_rows(rows)), ctx)
    }

    /// Register indexes, wrapping the base under the default alias.
    pub fn with_indexes(mut self, indexes: BTreeMap<String, RepeatedKeysDictionary>) -> Queryable {
        self.base = Plan::From(FromPlan::new(DEFAULT_ALIAS, self.base, indexes));
        self
    }

    /// Replace the execution policy.
    pub fn with_policy(mut self, policy: Policy) -> Queryable {
        self.policy = policy;
        self
    }

    /// Adjust only the unsupported-operator reaction.
    pub fn on_unsupported(mut self, mode: OnUnsupported) -> Queryable {
        self.policy.on_unsupported = mode;
        self
    }

    // === Intermediate operators (lazy) ===

    /// Filter by a predicate specification.
    pub fn where_spec(mut self, spec: FilterSpec) -> Queryable {
        self.ops.push(Op::Where(spec));
        self
    }

    /// Filter by an opaque predicate; never uses indexes.
    pub fn where_fn(
        mut self,
        f: impl Fn(&Row, &dyn AtomSource) -> Result<bool> + Send + Sync + 'static,
    ) -> Queryable {
        self.ops.push(Op::WhereFn(Arc::new(f)));
        self
    }

    /// Project into records with the given fields.
    pub fn select(mut self, fields: Vec<(String, Projection)>) -> Queryable {
        self.ops.push(Op::Select(fields));
        self
    }

    /// Project attribute paths, `(output name, alias-prefixed path)`.
    pub fn select_paths(self, fields: &[(&str, &str)]) -> Result<Queryable> {
        let mut out = Vec::with_capacity(fields.len());
        for (name, attr) in fields {
            out.push((name.to_string(), Projection::Path(FieldPath::parse(attr)?)));
        }
        Ok(self.select(out))
    }

    /// Flatten a collection-valued attribute into its member records.
    ///
    /// Rows without the attribute, or whose attribute is not a list or a
    /// set, contribute nothing.
    pub fn select_many(mut self, attr: &str) -> Result<Queryable> {
        self.ops.push(Op::SelectMany(FieldPath::parse(attr)?));
        Ok(self)
    }

    /// Sort by an attribute path.
    pub fn order_by(self, attr: &str, ascending: bool, nulls_last: bool) -> Result<Queryable> {
        let key = KeySpec::path(attr)?;
        Ok(self.order_by_key(key, ascending, nulls_last))
    }

    /// Sort by a key; repeated calls add subordinate keys.
    pub fn order_by_key(mut self, key: KeySpec, ascending: bool, nulls_last: bool) -> Queryable {
        self.ops.push(Op::OrderBy {
            key,
            ascending,
            nulls_last,
        });
        self
    }

    /// Subordinate sort key, equivalent to a further `order_by`.
    pub fn then_by(self, attr: &str, ascending: bool, nulls_last: bool) -> Result<Queryable> {
        self.order_by(attr, ascending, nulls_last)
    }

    /// Drop duplicate rows by identity.
    pub fn distinct(mut self) -> Queryable {
        self.ops.push(Op::Distinct(None));
        self
    }

    /// Drop rows whose key value was already produced.
    pub fn distinct_by(mut self, attr: &str) -> Result<Queryable> {
        let key = KeySpec::path(attr)?;
        self.ops.push(Op::Distinct(Some(key)));
        Ok(self)
    }

    /// Keep at most `n` rows.
    pub fn take(mut self, n: usize) -> Queryable {
        self.ops.push(Op::Take(n));
        self
    }

    /// Skip the first `n` rows.
    pub fn skip(mut self, n: usize) -> Queryable {
        self.ops.push(Op::Skip(n));
        self
    }

    /// Walk an attribute link from the current rows.
    pub fn traverse(mut self, attr: &str, options: TraverseOptions) -> Queryable {
        self.ops.push(Op::Traverse {
            attr: attr.to_string(),
            options,
        });
        self
    }

    // === Execution ===

    /// Translate the leading `where`/`select` run into a plan chain.
    fn build_plan(&self) -> Result<(Plan, usize)> {
        let mut plan = self.base.clone();
        let mut consumed = 0;
        for op in &self.ops {
            match op {
                Op::Where(spec) => {
                    if plan.from_context().is_none() {
                        plan = Plan::From(FromPlan::new(DEFAULT_ALIAS, plan, BTreeMap::new()));
                    }
                    plan = Plan::Where(WherePlan {
                        filter: Filter::Spec(spec.clone()),
                        based_on: Box::new(plan),
                    });
                }
                Op::WhereFn(f) => {
                    match self.policy.on_unsupported {
                        OnUnsupported::Error => {
                            return Err(Error::validation(
                                "opaque predicate cannot use the plan engine; \
                                 use a filter specification or relax the policy",
                            ))
                        }
                        OnUnsupported::Warn => {
                            tracing::warn!("opaque predicate falls back to a full scan");
                        }
                        OnUnsupported::Fallback => {}
                    }
                    plan = Plan::Where(WherePlan {
                        filter: Filter::Predicate(f.clone()),
                        based_on: Box::new(plan),
                    });
                }
                Op::Select(fields) => {
                    plan = Plan::Select(SelectPlan {
                        fields: Arc::new(fields.clone()),
                        based_on: Box::new(plan),
                    });
                }
                _ => break,
            }
            consumed += 1;
        }
        Ok((plan, consumed))
    }

    fn run(&self) -> Result<Vec<Row>> {
        let (plan, consumed) = self.build_plan()?;
        let optimized = optimize(plan, &OptimizerConfig::default())?;
        let started = Instant::now();

        let mut rows = Vec::new();
        for item in optimized.execute(&self.ctx)? {
            rows.push(item?);
            self.check_limits(rows.len(), started)?;
        }

        let src = self.ctx.source().clone();
        let mut pending_order: Vec<(KeySpec, bool, bool)> = Vec::new();
        let mut skip = 0usize;
        let mut take: Option<usize> = None;

        for op in &self.ops[consumed..] {
            self.check_limits(rows.len(), started)?;
            match op {
                Op::Where(spec) => {
                    let expr = Expression::compile(spec)?;
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if expr.matches(&row, &*src)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                Op::WhereFn(f) => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if f(&row, &*src)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                Op::Select(fields) => {
                    let plan = Plan::Select(SelectPlan {
                        fields: Arc::new(fields.clone()),
                        based_on: Box::new(Plan::List(ListPlan::from_rows(rows))),
                    });
                    rows = drain(plan.execute(&self.ctx)?)?;
                }
                Op::SelectMany(path) => {
                    let mut flattened = Vec::new();
                    for row in &rows {
                        flattened.extend(expand_members(row, path, &*src)?);
                    }
                    rows = flattened;
                }
                Op::OrderBy {
                    key,
                    ascending,
                    nulls_last,
                } => {
                    pending_order.push((key.clone(), *ascending, *nulls_last));
                }
                Op::Distinct(key) => {
                    rows = match key {
                        None => {
                            let mut seen = FxHashSet::default();
                            rows.into_iter()
                                .filter(|r| seen.insert(r.identity()))
                                .collect()
                        }
                        Some(key) => {
                            let mut seen: FxHashSet<Value> = FxHashSet::default();
                            let mut kept = Vec::new();
                            for row in rows {
                                if seen.insert(key.eval(&row, &*src)?) {
                                    kept.push(row);
                                }
                            }
                            kept
                        }
                    };
                }
                Op::Take(n) => {
                    take = Some(take.map_or(*n, |t| t.min(*n)));
                }
                Op::Skip(n) => {
                    skip += n;
                }
                Op::Traverse { attr, options } => {
                    rows = traverse(&rows, attr, options, &*src)?;
                }
            }
        }

        if !pending_order.is_empty() {
            rows = sort_rows(rows, &pending_order, &*src)?;
        }
        if skip > 0 {
            rows = rows.into_iter().skip(skip).collect();
        }
        if let Some(n) = take {
            rows.truncate(n);
        }
        Ok(rows)
    }

    fn check_limits(&self, produced: usize, started: Instant) -> Result<()> {
        self.ctx.token().check()?;
        if produced > self.policy.max_rows_local {
            return Err(Error::user(format!(
                "local evaluation exceeded max_rows_local ({})",
                self.policy.max_rows_local
            )));
        }
        if let Some(budget) = self.policy.timeout {
            if started.elapsed() > budget {
                return Err(Error::cancelled("query execution exceeded its timeout"));
            }
        }
        Ok(())
    }

    // === Terminal operators ===

    /// Run the pipeline and collect the rows.
    pub fn to_list(&self) -> Result<Vec<Row>> {
        self.run()
    }

    /// Run the pipeline and collect unique rows by identity.
    pub fn to_set(&self) -> Result<Vec<Row>> {
        let mut seen = FxHashSet::default();
        Ok(self
            .run()?
            .into_iter()
            .filter(|r| seen.insert(r.identity()))
            .collect())
    }

    /// Run the pipeline and collect the scalar at `attr` for every row.
    pub fn values(&self, attr: &str) -> Result<Vec<Value>> {
        let path = FieldPath::parse(attr)?;
        let src = self.ctx.source().clone();
        self.run()?
            .iter()
            .map(|r| r.value(&path, &*src))
            .collect()
    }

    /// Number of produced rows.
    pub fn count(&self) -> Result<usize> {
        Ok(self.run()?.len())
    }

    /// True when at least one row is produced.
    pub fn any(&self) -> Result<bool> {
        Ok(!self.run()?.is_empty())
    }

    /// True when every produced row satisfies the predicate.
    pub fn all(&self, spec: FilterSpec) -> Result<bool> {
        let expr = Expression::compile(&spec)?;
        let src = self.ctx.source().clone();
        for row in self.run()? {
            if !expr.matches(&row, &*src)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The first row; an empty result is a validation error.
    pub fn first(&self) -> Result<Row> {
        self.first_or_default()?
            .ok_or_else(|| Error::validation("first() on an empty sequence"))
    }

    /// The first row, or `None`.
    pub fn first_or_default(&self) -> Result<Option<Row>> {
        Ok(self.run()?.into_iter().next())
    }

    /// Map rows by the scalar at `key_attr`; duplicate keys are an error.
    pub fn to_dict(&self, key_attr: &str) -> Result<BTreeMap<Value, Row>> {
        let path = FieldPath::parse(key_attr)?;
        let src = self.ctx.source().clone();
        let mut out = BTreeMap::new();
        for row in self.run()? {
            let key = row.value(&path, &*src)?;
            if out.contains_key(&key) {
                return Err(Error::user(format!("duplicate key in to_dict: {}", key)));
            }
            out.insert(key, row);
        }
        Ok(out)
    }

    /// Sum a numeric attribute over the produced rows.
    pub fn sum_by(&self, attr: &str) -> Result<f64> {
        let path = FieldPath::parse(attr)?;
        let src = self.ctx.source().clone();
        let mut total = 0.0;
        for row in self.run()? {
            total += match row.value(&path, &*src)? {
                Value::Int(i) => i as f64,
                Value::Float(f) => f,
                _ => 0.0,
            };
        }
        Ok(total)
    }

    /// Smallest non-null value of `attr`, or `None`.
    pub fn min_by(&self, attr: &str) -> Result<Option<Value>> {
        self.extreme_by(attr, Ordering::Less)
    }

    /// Largest non-null value of `attr`, or `None`.
    pub fn max_by(&self, attr: &str) -> Result<Option<Value>> {
        self.extreme_by(attr, Ordering::Greater)
    }

    fn extreme_by(&self, attr: &str, keep: Ordering) -> Result<Option<Value>> {
        let path = FieldPath::parse(attr)?;
        let src = self.ctx.source().clone();
        let mut best: Option<Value> = None;
        for row in self.run()? {
            let v = row.value(&path, &*src)?;
            if v.is_null() {
                continue;
            }
            best = Some(match best {
                None => v,
                Some(b) => {
                    if v.cmp(&b) == keep {
                        v
                    } else {
                        b
                    }
                }
            });
        }
        Ok(best)
    }

    /// Mean of a numeric attribute (0 when no rows are produced).
    pub fn average(&self, attr: &str) -> Result<f64> {
        let rows = self.run()?;
        if rows.is_empty() {
            return Ok(0.0);
        }
        let path = FieldPath::parse(attr)?;
        let src = self.ctx.source().clone();
        let mut total = 0.0;
        for row in &rows {
            total += match row.value(&path, &*src)? {
                Value::Int(i) => i as f64,
                Value::Float(f) => f,
                _ => 0.0,
            };
        }
        Ok(total / rows.len() as f64)
    }

    /// Group produced rows by the scalar at `key_attr`.
    ///
    /// Groups come out in first-seen order.
    pub fn group_by(&self, key_attr: &str) -> Result<Vec<Grouping>> {
        let path = FieldPath::parse(key_attr)?;
        let src = self.ctx.source().clone();
        let mut order: Vec<Value> = Vec::new();
        let mut groups: BTreeMap<Value, Vec<Row>> = BTreeMap::new();
        for row in self.run()? {
            let key = row.value(&path, &*src)?;
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(row);
        }
        Ok(order
            .into_iter()
            .map(|key| {
                let rows = groups.remove(&key).unwrap_or_default();
                Grouping { key, rows }
            })
            .collect())
    }

    /// Describe how the pipeline would execute.
    pub fn explain(&self) -> Result<String> {
        let (plan, consumed) = self.build_plan()?;
        let optimized = optimize(plan, &OptimizerConfig::default())?;
        let mut segments = Vec::new();
        if consumed > 0 {
            let prefix: Vec<&str> = self.ops[..consumed].iter().map(|op| op.name()).collect();
            segments.push(format!("plan: {}", prefix.join(" -> ")));
            segments.push(format!("optimized: {}", optimized.node_name()));
        }
        if consumed < self.ops.len() {
            let local: Vec<&str> = self.ops[consumed..].iter().map(|op| op.name()).collect();
            segments.push(format!("local: {}", local.join(" -> ")));
        }
        if segments.is_empty() {
            segments.push(format!("scan: {}", optimized.node_name()));
        }
        Ok(segments.join(" | "))
    }
}

/// Member records of a row's collection-valued attribute.
fn expand_members(row: &Row, path: &FieldPath, src: &dyn AtomSource) -> Result<Vec<Row>> {
    use atomdb_collections::{Atom, FieldValue};
    let linked = match row.field(path, src)? {
        Some(FieldValue::Ref(r)) => r,
        _ => return Ok(Vec::new()),
    };
    let atom = linked.resolve(src)?;
    Ok(match &*atom {
        Atom::List(list) => list.elements(src)?.into_iter().map(Row::new).collect(),
        Atom::Set(set) => set.members(src)?.into_iter().map(Row::new).collect(),
        _ => Vec::new(),
    })
}

fn sort_rows(
    rows: Vec<Row>,
    order: &[(KeySpec, bool, bool)],
    src: &dyn AtomSource,
) -> Result<Vec<Row>> {
    let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut keys = Vec::with_capacity(order.len());
        for (spec, _, _) in order {
            keys.push(spec.eval(&row, src)?);
        }
        keyed.push((keys, row));
    }
    keyed.sort_by(|a, b| {
        for (i, (_, ascending, nulls_last)) in order.iter().enumerate() {
            let (va, vb) = (&a.0[i], &b.0[i]);
            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if *nulls_last {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, true) => {
                    if *nulls_last {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, false) => {
                    let ord = va.cmp(vb);
                    if *ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}
