//! Assignment of contiguous worker ranges to components and groups.

use crate::error::{display_path, StructuralError};
use crate::model::{ComponentPlan, GroupPlan, NodeRef};
use std::ops::Range;

/// Workers `node` needs to run.
pub(crate) fn requirement(groups: &[GroupPlan], comps: &[ComponentPlan], node: NodeRef) -> usize {
    match node {
        NodeRef::Component(c) => comps[c].required_workers.max(1),
        NodeRef::Group(g) => {
            let plan = &groups[g];
            let needs: Vec<usize> = plan
                .children
                .iter()
                .map(|&child| requirement(groups, comps, child))
                .collect();
            let own = plan.min_workers.max(1);
            if plan.parallel && needs.iter().any(|&n| n > 1) {
                needs.iter().sum::<usize>().max(own)
            } else {
                needs.into_iter().max().unwrap_or(1).max(own)
            }
        }
    }
}

/// Gives the root all `size` workers and splits them down the tree.
pub(crate) fn assign(groups: &mut [GroupPlan], comps: &mut [ComponentPlan], size: usize) -> Result<(), StructuralError> {
    assign_node(groups, comps, NodeRef::Group(0), 0..size)
}

fn insufficient(path: &str, required: usize, available: usize) -> StructuralError {
    StructuralError::InsufficientWorkers {
        path: display_path(path).to_string(),
        required,
        available,
    }
}

fn assign_node(
    groups: &mut [GroupPlan],
    comps: &mut [ComponentPlan],
    node: NodeRef,
    range: Range<usize>,
) -> Result<(), StructuralError> {
    let needed = requirement(groups, comps, node);
    match node {
        NodeRef::Component(c) => {
            if range.len() < needed {
                return Err(insufficient(&comps[c].path, needed, range.len()));
            }
            comps[c].workers = range.start..range.start + needed;
            Ok(())
        }
        NodeRef::Group(g) => {
            // A serial group only fails on its own minimum; children report
            // their own shortfall.
            let own = if groups[g].parallel { needed } else { groups[g].min_workers };
            if range.len() < own {
                return Err(insufficient(&groups[g].path, own, range.len()));
            }
            groups[g].workers = range.clone();
            let children = groups[g].children.clone();
            if !groups[g].parallel {
                for child in children {
                    assign_node(groups, comps, child, range.clone())?;
                }
                return Ok(());
            }
            let needs: Vec<usize> = children
                .iter()
                .map(|&child| requirement(groups, comps, child))
                .collect();
            for (child, sub) in children.iter().zip(split(range, &needs, &children)) {
                assign_node(groups, comps, *child, sub)?;
            }
            Ok(())
        }
    }
}

/// Worker ranges for the children of a parallel group.
///
/// With enough workers every child gets a disjoint range of its requirement
/// and leftover workers go round-robin to child groups. Otherwise the
/// single-worker children are blocked contiguously onto the available workers.
fn split(range: Range<usize>, needs: &[usize], children: &[NodeRef]) -> Vec<Range<usize>> {
    let available = range.len();
    let total: usize = needs.iter().sum();
    if total <= available {
        let mut sizes = needs.to_vec();
        let expandable: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, NodeRef::Group(_)))
            .map(|(i, _)| i)
            .collect();
        if !expandable.is_empty() {
            for k in 0..available - total {
                sizes[expandable[k % expandable.len()]] += 1;
            }
        }
        let mut start = range.start;
        sizes
            .into_iter()
            .map(|size| {
                let r = start..start + size;
                start += size;
                r
            })
            .collect()
    } else {
        let n = needs.len();
        (0..n)
            .map(|i| {
                let w = range.start + i * available / n;
                w..w + 1
            })
            .collect()
    }
}
