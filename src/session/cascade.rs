//! Relationship cascade resolution.
//!
//! Turns a set of root entities into a flush plan:
//! 1. Walk cascade-enabled edges depth-first to collect every entity the
//!    roots drag along (parent → collection members for `FromParent`,
//!    child → referenced parent for `FromChild`).
//! 2. Order the entities still awaiting their first insert so that a
//!    referenced parent always precedes the children holding its foreign
//!    key. A cycle among them cannot be ordered and is reported.

use crate::error::{Error, Result};
use crate::model::{Entity, EntityKey, EntityState, Metadata};
use std::collections::{HashMap, HashSet};

/// Result of cascade resolution.
#[derive(Debug, Default)]
pub struct CascadePlan {
    /// Entities without identity, parents before children.
    pub inserts: Vec<Entity>,
    /// Reachable entities that already have an identity, in discovery order.
    pub existing: Vec<Entity>,
}

/// Resolve `roots` into an ordered plan.
///
/// # Errors
///
/// Returns `CyclicRelationship` if entities awaiting insert reference each
/// other in a cycle.
pub fn resolve(roots: &[Entity], metadata: &Metadata) -> Result<CascadePlan> {
    let (inserts, existing): (Vec<Entity>, Vec<Entity>) = closure(roots, metadata)
        .into_iter()
        .partition(|e| matches!(e.state(), EntityState::Transient | EntityState::Pending));

    Ok(CascadePlan {
        inserts: insertion_order(&inserts, metadata)?,
        existing,
    })
}

/// Every entity reachable from `roots` through cascade-enabled edges,
/// roots included, in depth-first discovery order.
#[must_use]
pub fn closure(roots: &[Entity], metadata: &Metadata) -> Vec<Entity> {
    let mut seen: HashSet<EntityKey> = HashSet::new();
    let mut out = Vec::new();

    for root in roots {
        let mut stack = vec![root.clone()];
        while let Some(entity) = stack.pop() {
            if !seen.insert(entity.key()) {
                continue;
            }

            let table = entity.table();
            let mut next = Vec::new();
            for rel in metadata.relationships_as_parent(&table) {
                if rel.cascade().from_parent() {
                    next.extend(rel.children(&entity));
                }
            }
            for rel in metadata.relationships_as_child(&table) {
                if rel.cascade().from_child() {
                    next.extend(rel.parent_of(&entity));
                }
            }

            out.push(entity);
            // Reverse so the first related entity is visited first.
            stack.extend(next.into_iter().rev());
        }
    }

    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order `pending` so that every referenced entity precedes its referencers.
///
/// Only references between members of `pending` constrain the order;
/// entities keep their input order otherwise.
///
/// # Errors
///
/// Returns `CyclicRelationship` naming the entities of the first cycle found.
pub fn insertion_order(pending: &[Entity], metadata: &Metadata) -> Result<Vec<Entity>> {
    let index: HashMap<EntityKey, usize> = pending
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key(), i))
        .collect();

    // deps[i]: positions of the pending parents entity i references.
    let deps: Vec<Vec<usize>> = pending
        .iter()
        .map(|entity| {
            metadata
                .relationships_as_child(&entity.table())
                .filter_map(|rel| rel.parent_of(entity))
                .filter_map(|parent| index.get(&parent.key()).copied())
                .collect()
        })
        .collect();

    let mut marks: Vec<Option<Mark>> = vec![None; pending.len()];
    let mut path: Vec<usize> = Vec::new();
    let mut order: Vec<usize> = Vec::with_capacity(pending.len());

    for start in 0..pending.len() {
        visit(start, &deps, &mut marks, &mut path, &mut order).map_err(|cycle| {
            Error::CyclicRelationship {
                cycle: cycle.into_iter().map(|i| pending[i].label()).collect(),
            }
        })?;
    }

    Ok(order.into_iter().map(|i| pending[i].clone()).collect())
}

/// Depth-first post-order visit. On a back edge, returns the cycle as
/// positions, first node repeated at the end.
fn visit(
    node: usize,
    deps: &[Vec<usize>],
    marks: &mut [Option<Mark>],
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> std::result::Result<(), Vec<usize>> {
    match marks[node] {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let from = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle = path[from..].to_vec();
            cycle.push(node);
            return Err(cycle);
        }
        None => {}
    }

    marks[node] = Some(Mark::Visiting);
    path.push(node);
    for &dep in &deps[node] {
        visit(dep, deps, marks, path, order)?;
    }
    path.pop();
    marks[node] = Some(Mark::Done);
    order.push(node);
    Ok(())
}
