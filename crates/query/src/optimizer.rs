//! Plan rewriting: compilation, pushdown, index matching and merging.
//!
//! Passes are applied bottom-up and iterated to a fixpoint:
//!
//! 1. *Compile*: pending filter specifications become expression trees;
//!    parse errors surface as validation failures.
//! 2. *Pushdown*: a where-plan whose attributes all map through path
//!    projections of the select-plan below it sinks past the projection,
//!    attribute paths rewritten.
//! 3. *Index matching / merge / union*: the predicate is normalized to a
//!    bounded disjunctive normal form; per conjunct, equality, IN and
//!    between terms over indexed fields become indexed (range) search
//!    plans, wrapped in an and-merge when several apply, with residual
//!    terms kept in a where-plan above; across conjuncts that all produced
//!    indexable plans the results union under an or-merge.

use crate::expr::{Expression, FieldPath, Operator, Term};
use crate::plan::{
    AndMergePlan, Filter, FromPlan, IndexedRangeSearchPlan, IndexedSearchPlan, OrMergePlan, Plan,
    Projection, SelectPlan, WherePlan,
};
use atomdb_collections::RepeatedKeysDictionary;
use atomdb_core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Optimizer tuning.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Abort DNF expansion past this many conjuncts and fall back to tree
    /// execution.
    pub dnf_term_limit: usize,
    /// Upper bound on rewrite iterations; normally fixpoint is reached in
    /// two or three.
    pub max_passes: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            dnf_term_limit: 64,
            max_passes: 8,
        }
    }
}

/// Rewrite a plan until no pass changes it.
pub fn optimize(plan: Plan, config: &OptimizerConfig) -> Result<Plan> {
    let mut plan = plan;
    for _ in 0..config.max_passes {
        let (next, changed) = rewrite(plan, config)?;
        plan = next;
        if !changed {
            break;
        }
    }
    Ok(plan)
}

fn rewrite(plan: Plan, config: &OptimizerConfig) -> Result<(Plan, bool)> {
    // Children first.
    let (plan, mut changed) = match plan {
        Plan::From(mut p) => {
            let (child, c) = rewrite(*p.based_on, config)?;
            p.based_on = Box::new(child);
            (Plan::From(p), c)
        }
        Plan::Where(mut p) => {
            let (child, c) = rewrite(*p.based_on, config)?;
            p.based_on = Box::new(child);
            (Plan::Where(p), c)
        }
        Plan::Select(mut p) => {
            let (child, c) = rewrite(*p.based_on, config)?;
            p.based_on = Box::new(child);
            (Plan::Select(p), c)
        }
        Plan::AndMerge(mut p) => {
            let mut any = false;
            let mut out = Vec::with_capacity(p.children.len());
            for child in p.children {
                let (child, c) = rewrite(child, config)?;
                any |= c;
                out.push(child);
            }
            p.children = out;
            (Plan::AndMerge(p), any)
        }
        Plan::OrMerge(mut p) => {
            let mut any = false;
            let mut out = Vec::with_capacity(p.children.len());
            for child in p.children {
                let (child, c) = rewrite(child, config)?;
                any |= c;
                out.push(child);
            }
            p.children = out;
            (Plan::OrMerge(p), any)
        }
        leaf => (leaf, false),
    };

    // Local rewrites on where-plans.
    let plan = match plan {
        Plan::Where(mut where_plan) => {
            // Pass 1: compile.
            if let Filter::Spec(spec) = &where_plan.filter {
                where_plan.filter = Filter::Compiled(Arc::new(Expression::compile(spec)?));
                changed = true;
            }

            // Pass 2: pushdown past a projection.
            if let (Filter::Compiled(expr), Plan::Select(select)) =
                (&where_plan.filter, &*where_plan.based_on)
            {
                if let Some(rewritten) = push_past_select(expr, select) {
                    let inner = Plan::Where(WherePlan {
                        filter: Filter::Compiled(Arc::new(rewritten)),
                        based_on: select.based_on.clone(),
                    });
                    let mut select = select.clone();
                    select.based_on = Box::new(inner);
                    return Ok((Plan::Select(select), true));
                }
            }

            // Pass 3-5: match against indexes directly above a from-plan.
            if let (Filter::Compiled(expr), Plan::From(from)) =
                (&where_plan.filter, &*where_plan.based_on)
            {
                if !from.indexes.is_empty() {
                    if let Some(rewritten) = match_indexes(expr, from, config) {
                        tracing::debug!(node = rewritten.node_name(), "index rewrite applied");
                        return Ok((rewritten, true));
                    }
                }
            }

            Plan::Where(where_plan)
        }
        other => other,
    };

    Ok((plan, changed))
}

/// Rewrite the expression so it reads through the projection, if every
/// referenced attribute maps to a path projection.
fn push_past_select(expr: &Expression, select: &SelectPlan) -> Option<Expression> {
    let fields: BTreeMap<&str, &Projection> = select
        .fields
        .iter()
        .map(|(name, p)| (name.as_str(), p))
        .collect();
    rewrite_expr_paths(expr, &fields)
}

fn rewrite_expr_paths(
    expr: &Expression,
    fields: &BTreeMap<&str, &Projection>,
) -> Option<Expression> {
    match expr {
        Expression::Term(t) => {
            let first = t.path.segments().first()?;
            match fields.get(first.as_str()) {
                Some(Projection::Path(source_path)) => {
                    let mut segments = source_path.segments().to_vec();
                    segments.extend(t.path.segments().iter().skip(1).cloned());
                    let mut t = t.clone();
                    t.path = FieldPath::new(source_path.alias(), segments);
                    Some(Expression::Term(t))
                }
                _ => None,
            }
        }
        Expression::And(children) => Some(Expression::And(
            children
                .iter()
                .map(|c| rewrite_expr_paths(c, fields))
                .collect::<Option<_>>()?,
        )),
        Expression::Or(children) => Some(Expression::Or(
            children
                .iter()
                .map(|c| rewrite_expr_paths(c, fields))
                .collect::<Option<_>>()?,
        )),
        Expression::Not(inner) => Some(Expression::Not(Box::new(rewrite_expr_paths(
            inner, fields,
        )?))),
    }
}

/// True when a term can be answered by a registered index.
fn indexable<'a>(
    term: &Term,
    from: &'a FromPlan,
) -> Option<&'a RepeatedKeysDictionary> {
    if term.negated || term.path.alias() != from.alias {
        return None;
    }
    match term.op {
        Operator::Eq | Operator::In | Operator::Between { .. } => {
            from.indexes.get(&term.path.dotted())
        }
        _ => None,
    }
}

fn term_to_index_plan(term: &Term, index: &RepeatedKeysDictionary) -> Plan {
    match term.op {
        Operator::Eq => Plan::IndexedSearch(IndexedSearchPlan {
            field: term.path.dotted(),
            keys: Arc::new(vec![term.operands[0].clone()]),
            index: index.clone(),
        }),
        Operator::In => Plan::IndexedSearch(IndexedSearchPlan {
            field: term.path.dotted(),
            keys: Arc::new(term.operands.clone()),
            index: index.clone(),
        }),
        Operator::Between { inclusive } => Plan::IndexedRange(IndexedRangeSearchPlan {
            field: term.path.dotted(),
            lo: Some(term.operands[0].clone()),
            hi: Some(term.operands[1].clone()),
            inclusive,
            index: index.clone(),
        }),
        _ => unreachable!("indexable() only admits eq/in/between"),
    }
}

/// Try to answer the whole predicate from indexes.
///
/// Every disjunct must contribute at least one indexable term; otherwise
/// that disjunct would require a full scan anyway and the rewrite is
/// abandoned.
fn match_indexes(
    expr: &Expression,
    from: &FromPlan,
    config: &OptimizerConfig,
) -> Option<Plan> {
    let dnf = expr.to_dnf(config.dnf_term_limit)?;
    let mut disjunct_plans = Vec::with_capacity(dnf.len());
    for conjunct in dnf {
        let mut indexed = Vec::new();
        let mut residual = Vec::new();
        for term in conjunct {
            match indexable(&term, from) {
                Some(index) => indexed.push(term_to_index_plan(&term, index)),
                None => residual.push(term),
            }
        }
        if indexed.is_empty() {
            return None;
        }
        let mut node = if indexed.len() == 1 {
            indexed.pop().expect("one element")
        } else {
            Plan::AndMerge(AndMergePlan { children: indexed })
        };
        if !residual.is_empty() {
            let residual_expr = if residual.len() == 1 {
                Expression::Term(residual.pop().expect("one element"))
            } else {
                Expression::And(residual.into_iter().map(Expression::Term).collect())
            };
            node = Plan::Where(WherePlan {
                filter: Filter::Compiled(Arc::new(residual_expr)),
                based_on: Box::new(node),
            });
        }
        disjunct_plans.push(node);
    }
    Some(if disjunct_plans.len() == 1 {
        disjunct_plans.pop().expect("one element")
    } else {
        Plan::OrMerge(OrMergePlan {
            children: disjunct_plans,
        })
    })
}
