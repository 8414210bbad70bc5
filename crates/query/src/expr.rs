//! The predicate expression language.
//!
//! Predicates arrive as [`FilterSpec`] token trees: terms of the form
//! `(attr, operator, operands)` combined with and/or/not. They compile into
//! [`Expression`] trees. Attributes are dotted paths with a required alias
//! prefix matching the enclosing from-plan. Compilation validates operator
//! names, arity and attribute shape; the optimizer later normalizes the
//! tree to disjunctive normal form to match terms against indexes.

use crate::context::Row;
use atomdb_collections::AtomSource;
use atomdb_core::{Error, Result, Value};
use std::cmp::Ordering;
use std::fmt;

/// A dotted attribute path: alias plus at least one field segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    alias: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse `"alias.field.subfield"`.
    pub fn parse(attr: &str) -> Result<FieldPath> {
        let mut parts = attr.split('.');
        let alias = parts.next().unwrap_or("").to_string();
        let segments: Vec<String> = parts.map(|s| s.to_string()).collect();
        if alias.is_empty() {
            return Err(Error::validation(format!(
                "attribute {:?} lacks an alias prefix",
                attr
            )));
        }
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(Error::validation(format!(
                "attribute {:?} must be alias.field[.field...]",
                attr
            )));
        }
        Ok(FieldPath { alias, segments })
    }

    /// Build from parts already split.
    pub fn new(alias: impl Into<String>, segments: Vec<String>) -> FieldPath {
        FieldPath {
            alias: alias.into(),
            segments,
        }
    }

    /// The alias prefix.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Path segments after the alias.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The full dotted form, used as the index map key.
    pub fn dotted(&self) -> String {
        let mut out = self.alias.clone();
        for s in &self.segments {
            out.push('.');
            out.push_str(s);
        }
        out
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dotted())
    }
}

/// Comparison operators of the expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// membership in a literal list
    In,
    /// substring / sub-slice containment
    Contains,
    /// bounded range with per-bound inclusivity
    Between {
        /// `(low inclusive, high inclusive)`
        inclusive: (bool, bool),
    },
}

impl Operator {
    /// Parse the token form used in filter specifications.
    pub fn parse(token: &str) -> Result<Operator> {
        Ok(match token {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "in" => Operator::In,
            "contains" => Operator::Contains,
            "between[]" => Operator::Between {
                inclusive: (true, true),
            },
            "between()" => Operator::Between {
                inclusive: (false, false),
            },
            "between[)" => Operator::Between {
                inclusive: (true, false),
            },
            "between(]" => Operator::Between {
                inclusive: (false, true),
            },
            other => {
                return Err(Error::validation(format!(
                    "unknown operator {:?}",
                    other
                )))
            }
        })
    }

    fn check_arity(&self, operands: usize) -> Result<()> {
        let ok = match self {
            Operator::In => operands >= 1,
            Operator::Between { .. } => operands == 2,
            _ => operands == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "operator {:?} got {} operands",
                self, operands
            )))
        }
    }
}

/// Token-tree form of a predicate, awaiting compilation.
#[derive(Debug, Clone)]
pub enum FilterSpec {
    /// `(attr, operator, operands)`
    Term {
        /// Alias-prefixed dotted attribute.
        attr: String,
        /// Operator token (`"=="`, `"between[)"`, ...).
        op: String,
        /// Operand values.
        operands: Vec<Value>,
    },
    /// Conjunction.
    And(Vec<FilterSpec>),
    /// Disjunction.
    Or(Vec<FilterSpec>),
    /// Negation.
    Not(Box<FilterSpec>),
}

impl FilterSpec {
    /// A single-operand comparison term.
    pub fn cmp(attr: impl Into<String>, op: &str, value: impl Into<Value>) -> FilterSpec {
        FilterSpec::Term {
            attr: attr.into(),
            op: op.to_string(),
            operands: vec![value.into()],
        }
    }

    /// An `in` term over a literal list.
    pub fn in_list(
        attr: impl Into<String>,
        values: impl IntoIterator<Item = Value>,
    ) -> FilterSpec {
        FilterSpec::Term {
            attr: attr.into(),
            op: "in".to_string(),
            operands: values.into_iter().collect(),
        }
    }

    /// A between term; `inclusive` selects the bound tokens.
    pub fn between(
        attr: impl Into<String>,
        lo: impl Into<Value>,
        hi: impl Into<Value>,
        inclusive: (bool, bool),
    ) -> FilterSpec {
        let op = match inclusive {
            (true, true) => "between[]",
            (false, false) => "between()",
            (true, false) => "between[)",
            (false, true) => "between(]",
        };
        FilterSpec::Term {
            attr: attr.into(),
            op: op.to_string(),
            operands: vec![lo.into(), hi.into()],
        }
    }

    /// Conjunction of both specs.
    pub fn and(self, other: FilterSpec) -> FilterSpec {
        FilterSpec::And(vec![self, other])
    }

    /// Disjunction of both specs.
    pub fn or(self, other: FilterSpec) -> FilterSpec {
        FilterSpec::Or(vec![self, other])
    }

    /// Negation.
    pub fn negate(self) -> FilterSpec {
        FilterSpec::Not(Box::new(self))
    }
}

/// A compiled comparison term.
#[derive(Debug, Clone)]
pub struct Term {
    /// The attribute path.
    pub path: FieldPath,
    /// The comparison operator.
    pub op: Operator,
    /// Operand values.
    pub operands: Vec<Value>,
    /// True when the term is logically negated.
    pub negated: bool,
}

/// Numeric view of a value, for cross-kind comparison.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Equality as the predicate language sees it: nulls equal nulls, numbers
/// compare by magnitude across int/float.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering as the predicate language sees it: `None` when either side is
/// null or the kinds are not comparable.
pub fn values_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Term {
    fn evaluate(&self, value: &Value) -> bool {
        let hit = match &self.op {
            Operator::Eq => values_equal(value, &self.operands[0]),
            Operator::Ne => !values_equal(value, &self.operands[0]),
            Operator::Lt => values_cmp(value, &self.operands[0]) == Some(Ordering::Less),
            Operator::Le => matches!(
                values_cmp(value, &self.operands[0]),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            Operator::Gt => values_cmp(value, &self.operands[0]) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                values_cmp(value, &self.operands[0]),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            Operator::In => self.operands.iter().any(|op| values_equal(value, op)),
            Operator::Contains => value.contains_value(&self.operands[0]),
            Operator::Between { inclusive } => {
                let (lo, hi) = (&self.operands[0], &self.operands[1]);
                between(value, lo, hi, *inclusive)
            }
        };
        hit != self.negated
    }

    /// Evaluate against a row.
    pub fn matches(&self, row: &Row, src: &dyn AtomSource) -> Result<bool> {
        let value = row.value(&self.path, src)?;
        Ok(self.evaluate(&value))
    }
}

fn between(value: &Value, lo: &Value, hi: &Value, inclusive: (bool, bool)) -> bool {
    if value.is_null() {
        return false;
    }
    // An inverted range is empty by definition.
    if values_cmp(lo, hi) == Some(Ordering::Greater) {
        return false;
    }
    let lower_ok = match values_cmp(value, lo) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Equal) => inclusive.0,
        _ => false,
    };
    if !lower_ok {
        return false;
    }
    match values_cmp(value, hi) {
        Some(Ordering::Less) => true,
        Some(Ordering::Equal) => inclusive.1,
        _ => false,
    }
}

/// A compiled predicate tree.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A leaf comparison.
    Term(Term),
    /// All children must hold.
    And(Vec<Expression>),
    /// At least one child must hold.
    Or(Vec<Expression>),
    /// The child must not hold.
    Not(Box<Expression>),
}

impl Expression {
    /// Compile a token tree, validating attributes, operators and arity.
    pub fn compile(spec: &FilterSpec) -> Result<Expression> {
        match spec {
            FilterSpec::Term { attr, op, operands } => {
                let path = FieldPath::parse(attr)?;
                let op = Operator::parse(op)?;
                op.check_arity(operands.len())?;
                Ok(Expression::Term(Term {
                    path,
                    op,
                    operands: operands.clone(),
                    negated: false,
                }))
            }
            FilterSpec::And(children) => {
                if children.is_empty() {
                    return Err(Error::validation("empty conjunction"));
                }
                Ok(Expression::And(
                    children.iter().map(Expression::compile).collect::<Result<_>>()?,
                ))
            }
            FilterSpec::Or(children) => {
                if children.is_empty() {
                    return Err(Error::validation("empty disjunction"));
                }
                Ok(Expression::Or(
                    children.iter().map(Expression::compile).collect::<Result<_>>()?,
                ))
            }
            FilterSpec::Not(inner) => Ok(Expression::Not(Box::new(Expression::compile(inner)?))),
        }
    }

    /// Evaluate against a row.
    pub fn matches(&self, row: &Row, src: &dyn AtomSource) -> Result<bool> {
        Ok(match self {
            Expression::Term(t) => t.matches(row, src)?,
            Expression::And(children) => {
                for c in children {
                    if !c.matches(row, src)? {
                        return Ok(false);
                    }
                }
                true
            }
            Expression::Or(children) => {
                for c in children {
                    if c.matches(row, src)? {
                        return Ok(true);
                    }
                }
                false
            }
            Expression::Not(inner) => !inner.matches(row, src)?,
        })
    }

    /// Push negations down to the leaves (De Morgan).
    fn normalized(&self) -> Expression {
        match self {
            Expression::Term(t) => Expression::Term(t.clone()),
            Expression::And(children) => {
                Expression::And(children.iter().map(|c| c.normalized()).collect())
            }
            Expression::Or(children) => {
                Expression::Or(children.iter().map(|c| c.normalized()).collect())
            }
            Expression::Not(inner) => match &**inner {
                Expression::Term(t) => {
                    let mut t = t.clone();
                    t.negated = !t.negated;
                    Expression::Term(t)
                }
                Expression::And(children) => Expression::Or(
                    children
                        .iter()
                        .map(|c| Expression::Not(Box::new(c.clone())).normalized())
                        .collect(),
                ),
                Expression::Or(children) => Expression::And(
                    children
                        .iter()
                        .map(|c| Expression::Not(Box::new(c.clone())).normalized())
                        .collect(),
                ),
                Expression::Not(inner2) => inner2.normalized(),
            },
        }
    }

    /// Disjunctive normal form: a list of conjuncts, each a list of terms.
    ///
    /// Returns `None` when the expansion would exceed `term_limit`
    /// conjuncts; the caller then falls back to tree execution.
    pub fn to_dnf(&self, term_limit: usize) -> Option<Vec<Vec<Term>>> {
        fn go(expr: &Expression, limit: usize) -> Option<Vec<Vec<Term>>> {
            match expr {
                Expression::Term(t) => Some(vec![vec![t.clone()]]),
                Expression::Or(children) => {
                    let mut out = Vec::new();
                    for c in children {
                        out.extend(go(c, limit)?);
                        if out.len() > limit {
                            return None;
                        }
                    }
                    Some(out)
                }
                Expression::And(children) => {
                    let mut acc: Vec<Vec<Term>> = vec![Vec::new()];
                    for c in children {
                        let child = go(c, limit)?;
                        let mut next = Vec::with_capacity(acc.len() * child.len());
                        for left in &acc {
                            for right in &child {
                                let mut merged = left.clone();
                                merged.extend(right.iter().cloned());
                                next.push(merged);
                                if next.len() > limit {
                                    return None;
                                }
                            }
                        }
                        acc = next;
                    }
                    Some(acc)
                }
                Expression::Not(_) => unreachable!("normalized() removes inner negations"),
            }
        }
        go(&self.normalized(), term_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_collections::{NullSource, Record};

    fn row(age: i64, country: &str) -> Row {
        Row::from_record(
            Record::new()
                .set("age", Value::Int(age))
                .unwrap()
                .set("country", Value::from(country))
                .unwrap(),
        )
    }

    fn compile(spec: FilterSpec) -> Expression {
        Expression::compile(&spec).unwrap()
    }

    #[test]
    fn test_compile_validates() {
        assert!(Expression::compile(&FilterSpec::cmp("age", "==", 1))
            .unwrap_err()
            .is_validation());
        assert!(Expression::compile(&FilterSpec::cmp("r.age", "~~", 1))
            .unwrap_err()
            .is_validation());
        assert!(Expression::compile(&FilterSpec::Term {
            attr: "r.age".into(),
            op: "between[]".into(),
            operands: vec![Value::Int(1)],
        })
        .unwrap_err()
        .is_validation());
        assert!(Expression::compile(&FilterSpec::And(vec![]))
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_comparison_semantics() {
        let e = compile(FilterSpec::cmp("r.age", ">=", 18));
        assert!(e.matches(&row(30, "ES"), &NullSource).unwrap());
        assert!(e.matches(&row(18, "ES"), &NullSource).unwrap());
        assert!(!e.matches(&row(17, "ES"), &NullSource).unwrap());
        // Missing attribute is null, and null never orders.
        let missing = compile(FilterSpec::cmp("r.height", ">", 0));
        assert!(!missing.matches(&row(30, "ES"), &NullSource).unwrap());
    }

    #[test]
    fn test_numeric_cross_kind_equality() {
        let e = compile(FilterSpec::cmp("r.age", "==", Value::Float(30.0)));
        assert!(e.matches(&row(30, "ES"), &NullSource).unwrap());
    }

    #[test]
    fn test_in_and_contains() {
        let e = compile(FilterSpec::in_list(
            "r.country",
            [Value::from("ES"), Value::from("AR")],
        ));
        assert!(e.matches(&row(1, "AR"), &NullSource).unwrap());
        assert!(!e.matches(&row(1, "US"), &NullSource).unwrap());

        let c = compile(FilterSpec::cmp("r.country", "contains", "S"));
        assert!(c.matches(&row(1, "ES"), &NullSource).unwrap());
        assert!(!c.matches(&row(1, "AR"), &NullSource).unwrap());
    }

    #[test]
    fn test_between_bounds() {
        let rows: Vec<i64> = vec![9, 10, 15, 20, 21];
        let gather = |inc: (bool, bool)| -> Vec<i64> {
            let e = compile(FilterSpec::between("r.age", 10, 20, inc));
            rows.iter()
                .copied()
                .filter(|a| e.matches(&row(*a, "x"), &NullSource).unwrap())
                .collect()
        };
        assert_eq!(gather((true, true)), vec![10, 15, 20]);
        assert_eq!(gather((false, false)), vec![15]);
        assert_eq!(gather((true, false)), vec![10, 15]);
        assert_eq!(gather((false, true)), vec![15, 20]);
        // Inverted bounds are empty.
        let e = compile(FilterSpec::between("r.age", 20, 10, (true, true)));
        assert!(!e.matches(&row(15, "x"), &NullSource).unwrap());
    }

    #[test]
    fn test_boolean_combinators() {
        let e = compile(
            FilterSpec::cmp("r.age", ">=", 18)
                .and(FilterSpec::in_list("r.country", [Value::from("ES")])),
        );
        assert!(e.matches(&row(30, "ES"), &NullSource).unwrap());
        assert!(!e.matches(&row(30, "AR"), &NullSource).unwrap());

        let n = compile(FilterSpec::cmp("r.country", "==", "ES").negate());
        assert!(n.matches(&row(1, "AR"), &NullSource).unwrap());
    }

    #[test]
    fn test_dnf_expansion() {
        // (a | b) & (c | d) -> 4 conjuncts of 2 terms.
        let e = compile(
            FilterSpec::cmp("r.a", "==", 1)
                .or(FilterSpec::cmp("r.b", "==", 2))
                .and(FilterSpec::cmp("r.c", "==", 3).or(FilterSpec::cmp("r.d", "==", 4))),
        );
        let dnf = e.to_dnf(64).unwrap();
        assert_eq!(dnf.len(), 4);
        assert!(dnf.iter().all(|c| c.len() == 2));
        // A tight limit aborts expansion.
        assert!(e.to_dnf(2).is_none());
    }

    #[test]
    fn test_dnf_negation_pushdown() {
        let e = compile(
            FilterSpec::cmp("r.a", "==", 1)
                .and(FilterSpec::cmp("r.b", "==", 2))
                .negate(),
        );
        let dnf = e.to_dnf(64).unwrap();
        // !(a & b) -> !a | !b
        assert_eq!(dnf.len(), 2);
        assert!(dnf.iter().all(|c| c.len() == 1 && c[0].negated));
    }
}
