//! Graph traversal over record attribute links.

use crate::context::Row;
use atomdb_collections::atom_ref::RefIdentity;
use atomdb_collections::{Atom, AtomRef, AtomSource, FieldValue};
use atomdb_core::Result;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use uuid::Uuid;

/// Whether the traversed attribute points up (a scalar link) or down (a
/// collection of children).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Scalar link to a single parent-like record.
    Up,
    /// Collection link to child records.
    Down,
}

/// Visit order of the traversal frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Breadth-first: level by level.
    Bfs,
    /// Depth-first: follow each branch to the end first.
    Dfs,
}

/// Options of the traversal operator.
#[derive(Debug, Clone)]
pub struct TraverseOptions {
    /// Link direction; mismatched attribute shapes are skipped.
    pub direction: Direction,
    /// Visit order.
    pub strategy: Strategy,
    /// Maximum link distance from a start node; unlimited when `None`.
    pub max_depth: Option<u32>,
    /// Whether the start nodes themselves are produced.
    pub include_start_node: bool,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        TraverseOptions {
            direction: Direction::Up,
            strategy: Strategy::Dfs,
            max_depth: None,
            include_start_node: false,
        }
    }
}

/// Visited-set key: record identity when available, reference identity
/// otherwise. Two versions of the same logical record share an object id
/// and therefore count as one visit, which is what breaks cycles built
/// from path-copied snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VisitKey {
    Record(Uuid),
    Ref(RefIdentity),
}

fn visit_key(r: &AtomRef, src: &dyn AtomSource) -> Result<VisitKey> {
    let atom = r.resolve(src)?;
    Ok(match &*atom {
        Atom::Record(rec) => VisitKey::Record(*rec.object_id()),
        _ => VisitKey::Ref(r.identity()),
    })
}

/// Records linked from `row` through `attr` in the given direction.
fn neighbors(
    row: &Row,
    attr: &str,
    direction: Direction,
    src: &dyn AtomSource,
) -> Result<Vec<Row>> {
    let atom = row.atom_ref().resolve(src)?;
    let record = match &*atom {
        Atom::Record(r) => r,
        _ => return Ok(Vec::new()),
    };
    let linked = match record.get(attr, src)? {
        Some(FieldValue::Ref(r)) => r,
        _ => return Ok(Vec::new()),
    };
    let target = linked.resolve(src)?;
    let mut out = Vec::new();
    match (direction, &*target) {
        (Direction::Up, Atom::Record(_)) => out.push(Row::new(linked)),
        (Direction::Down, Atom::List(list)) => {
            for element in list.elements(src)? {
                if matches!(&*element.resolve(src)?, Atom::Record(_)) {
                    out.push(Row::new(element));
                }
            }
        }
        (Direction::Down, Atom::Set(set)) => {
            for member in set.members(src)? {
                if matches!(&*member.resolve(src)?, Atom::Record(_)) {
                    out.push(Row::new(member));
                }
            }
        }
        // Shape mismatch for the requested direction: nothing to follow.
        _ => {}
    }
    Ok(out)
}

/// Walk `attr` links from the start rows, producing reached records.
///
/// The visited set spans all start nodes, so overlapping subgraphs are
/// produced once. Depth is the link distance from the nearest start node.
pub fn traverse(
    start: &[Row],
    attr: &str,
    options: &TraverseOptions,
    src: &dyn AtomSource,
) -> Result<Vec<Row>> {
    let mut visited: FxHashSet<VisitKey> = FxHashSet::default();
    let mut out = Vec::new();
    let mut frontier: VecDeque<(Row, u32)> = VecDeque::new();

    for row in start {
        let key = visit_key(row.atom_ref(), src)?;
        if !visited.insert(key) {
            continue;
        }
        frontier.push_back((row.clone(), 0));
    }

    while let Some((row, depth)) = match options.strategy {
        Strategy::Bfs => frontier.pop_front(),
        Strategy::Dfs => frontier.pop_back(),
    } {
        if depth > 0 || options.include_start_node {
            out.push(row.clone());
        }
        if options.max_depth.is_some_and(|limit| depth >= limit) {
            continue;
        }
        let mut next = neighbors(&row, attr, options.direction, src)?;
        if options.strategy == Strategy::Dfs {
            // Reversed push so the first child is popped (and emitted) first.
            next.reverse();
        }
        for neighbor in next {
            let key = visit_key(neighbor.atom_ref(), src)?;
            if !visited.insert(key) {
                continue;
            }
            frontier.push_back((neighbor, depth + 1));
        }
    }
    Ok(out)
}
