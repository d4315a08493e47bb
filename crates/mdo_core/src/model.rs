//! The frozen, post-setup description of a model: registry, per-node plans,
//! execution orders, worker ranges and the transfer schedule.

use crate::component::{Component, DerivativeMode};
use crate::error::{display_path, MdoError, Result, StructuralError};
use crate::group::{stable_topological_order, GroupDef, NodeDef};
use crate::partition;
use crate::registry::{validate_name, GroupScope, Registry, RegistryBuilder, Scope};
use crate::solvers::{LgsSettings, LinearSolver, NonlinearSolver};
use crate::transfer::Transfers;
use crate::variable::{layout_of, LocalVar, VarDeclarations, VarKind};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRef {
    Component(usize),
    Group(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct ComponentPlan {
    pub path: String,
    pub u_range: Range<usize>,
    pub p_range: Range<usize>,
    pub inputs: Vec<LocalVar>,
    pub outputs: Vec<LocalVar>,
    pub explicit: bool,
    pub derivatives: DerivativeMode,
    pub required_workers: usize,
    pub workers: Range<usize>,
    /// (group, child index) from the root down to this component.
    pub ancestry: Vec<(usize, usize)>,
}

impl ComponentPlan {
    /// Rank that owns the component's entries for norms and gathers.
    pub fn owner(&self) -> usize {
        self.workers.start
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GroupPlan {
    pub path: String,
    pub depth: usize,
    pub children: Vec<NodeRef>,
    pub child_names: Vec<String>,
    /// Execution order as indices into `children`.
    pub order: Vec<usize>,
    pub cyclic: bool,
    pub parallel: bool,
    pub min_workers: usize,
    pub u_range: Range<usize>,
    pub p_range: Range<usize>,
    pub comps: Range<usize>,
    pub workers: Range<usize>,
    pub nonlinear: NonlinearSolver,
    pub linear: LinearSolver,
}

pub(crate) struct Model {
    pub registry: Registry,
    pub comps: Vec<ComponentPlan>,
    /// Pre-order; index 0 is the root.
    pub groups: Vec<GroupPlan>,
    pub transfers: Transfers,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("comps", &self.comps.len())
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Runs every component's `setup`, resolves names and connections, and
    /// freezes orders, worker ranges and the transfer schedule for `rank`.
    pub fn build(def: &GroupDef, components: &mut [Component], size: usize, rank: usize) -> Result<Model> {
        let mut builder = Builder {
            components,
            registry: RegistryBuilder::new(),
            comps: Vec::new(),
            groups: Vec::new(),
            defs: Vec::new(),
        };
        builder.visit_group(def, String::new(), 0, &mut Vec::new(), &mut Vec::new())?;
        let Builder {
            registry,
            mut comps,
            mut groups,
            defs,
            ..
        } = builder;

        let scopes: Vec<GroupScope> = groups
            .iter()
            .zip(&defs)
            .map(|(plan, def)| GroupScope {
                path: &plan.path,
                depth: plan.depth,
                connections: &def.connections,
            })
            .collect();
        let registry = registry.resolve_connections(&scopes)?;

        for (plan, var) in comps.iter_mut().zip(&registry.components) {
            plan.u_range = var.u_range.clone();
            plan.p_range = var.p_range.clone();
        }
        for plan in groups.iter_mut() {
            plan.u_range = span(&comps, &plan.comps, |c| &c.u_range);
            plan.p_range = span(&comps, &plan.comps, |c| &c.p_range);
        }

        order_children(&registry, &comps, &mut groups, &defs)?;
        partition::assign(&mut groups, &mut comps, size)?;
        let transfers = Transfers::build(&registry, &comps, rank);

        Ok(Model {
            registry,
            comps,
            groups,
            transfers,
        })
    }

    pub fn u_range(&self, node: NodeRef) -> Range<usize> {
        match node {
            NodeRef::Component(c) => self.comps[c].u_range.clone(),
            NodeRef::Group(g) => self.groups[g].u_range.clone(),
        }
    }

    pub fn p_range(&self, node: NodeRef) -> Range<usize> {
        match node {
            NodeRef::Component(c) => self.comps[c].p_range.clone(),
            NodeRef::Group(g) => self.groups[g].p_range.clone(),
        }
    }

    pub fn workers(&self, node: NodeRef) -> Range<usize> {
        match node {
            NodeRef::Component(c) => self.comps[c].workers.clone(),
            NodeRef::Group(g) => self.groups[g].workers.clone(),
        }
    }

    pub fn path(&self, node: NodeRef) -> &str {
        match node {
            NodeRef::Component(c) => &self.comps[c].path,
            NodeRef::Group(g) => &self.groups[g].path,
        }
    }

    /// Components under `node`, as a contiguous index range.
    pub fn comp_range(&self, node: NodeRef) -> Range<usize> {
        match node {
            NodeRef::Component(c) => c..c + 1,
            NodeRef::Group(g) => self.groups[g].comps.clone(),
        }
    }

    /// Owning rank of entry `index` of the output vector.
    pub fn owner_of(&self, index: usize) -> Option<usize> {
        let c = self.comps.partition_point(|c| c.u_range.end <= index);
        self.comps
            .get(c)
            .filter(|plan| plan.u_range.contains(&index))
            .map(ComponentPlan::owner)
    }

    pub fn group_by_path(&self, path: &str) -> Option<usize> {
        let path = if path == "<root>" { "" } else { path };
        self.groups.iter().position(|g| g.path == path)
    }
}

fn span(comps: &[ComponentPlan], range: &Range<usize>, field: impl Fn(&ComponentPlan) -> &Range<usize>) -> Range<usize> {
    match (comps.get(range.start), range.end.checked_sub(1).and_then(|l| comps.get(l))) {
        (Some(first), Some(last)) if !range.is_empty() => field(first).start..field(last).end,
        _ => {
            // Empty group: sit between its neighbours.
            let at = comps
                .get(range.start)
                .map(|c| field(c).start)
                .or_else(|| comps.last().map(|c| field(c).end))
                .unwrap_or(0);
            at..at
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

struct Builder<'a> {
    components: &'a mut [Component],
    registry: RegistryBuilder,
    comps: Vec<ComponentPlan>,
    groups: Vec<GroupPlan>,
    defs: Vec<&'a GroupDef>,
}

impl<'a> Builder<'a> {
    fn visit_group(
        &mut self,
        def: &'a GroupDef,
        path: String,
        depth: usize,
        chain: &mut Vec<Scope>,
        ancestry: &mut Vec<(usize, usize)>,
    ) -> Result<usize> {
        let index = self.groups.len();
        let first_comp = self.comps.len();
        self.groups.push(GroupPlan {
            path: path.clone(),
            depth,
            children: Vec::new(),
            child_names: def.children.iter().map(|c| c.name.clone()).collect(),
            order: Vec::new(),
            cyclic: false,
            parallel: def.parallel,
            min_workers: def.min_workers,
            u_range: 0..0,
            p_range: 0..0,
            comps: first_comp..first_comp,
            workers: 0..0,
            nonlinear: def.nonlinear_solver.clone().unwrap_or_default(),
            linear: LinearSolver::RunOnce,
        });
        self.defs.push(def);

        let mut names = HashSet::new();
        let mut children = Vec::with_capacity(def.children.len());
        for (child_index, child) in def.children.iter().enumerate() {
            validate_name(&child.name)?;
            if !names.insert(child.name.as_str()) {
                return Err(StructuralError::DuplicateSubsystem {
                    group: display_path(&path).to_string(),
                    name: child.name.clone(),
                }
                .into());
            }
            let child_path = join_path(&path, &child.name);
            chain.push(Scope {
                name: child.name.clone(),
                promotes: child.promotes.clone(),
            });
            ancestry.push((index, child_index));
            let node = match &child.node {
                NodeDef::Leaf(c) => NodeRef::Component(self.visit_component(*c, child_path, chain, ancestry)?),
                NodeDef::Group(g) => NodeRef::Group(self.visit_group(g, child_path, depth + 1, chain, ancestry)?),
            };
            chain.pop();
            ancestry.pop();
            children.push(node);
        }

        let plan = &mut self.groups[index];
        plan.children = children;
        plan.comps = first_comp..self.comps.len();
        Ok(index)
    }

    fn visit_component(
        &mut self,
        component: usize,
        path: String,
        chain: &[Scope],
        ancestry: &[(usize, usize)],
    ) -> Result<usize> {
        let index = self.comps.len();
        let target = &mut self.components[component];
        let mut decl = VarDeclarations::new();
        target.setup(&mut decl);
        let vars = decl.into_vars();
        let inputs = layout_of(vars.iter().filter(|v| v.kind == VarKind::Input));
        let outputs = layout_of(vars.iter().filter(|v| v.kind == VarKind::Output));
        let plan = ComponentPlan {
            path: path.clone(),
            u_range: 0..0,
            p_range: 0..0,
            inputs,
            outputs,
            explicit: target.is_explicit(),
            derivatives: target.derivatives(),
            required_workers: target.required_workers(),
            workers: 0..0,
            ancestry: ancestry.to_vec(),
        };
        self.registry.register(index, &path, chain, vars)?;
        self.comps.push(plan);
        Ok(index)
    }
}

/// Deepest common group of two components and the children of that group
/// containing each of them.
pub(crate) fn common_ancestor(a: &[(usize, usize)], b: &[(usize, usize)]) -> (usize, usize, usize) {
    let mut k = 0;
    while k + 1 < a.len() && k + 1 < b.len() && a[k + 1].0 == b[k + 1].0 {
        k += 1;
    }
    (a[k].0, a[k].1, b[k].1)
}

fn order_children(
    registry: &Registry,
    comps: &[ComponentPlan],
    groups: &mut [GroupPlan],
    defs: &[&GroupDef],
) -> Result<()> {
    let mut edges: Vec<BTreeSet<(usize, usize)>> = vec![BTreeSet::new(); groups.len()];
    for connection in registry.connections() {
        let src = registry.variable(connection.src).component;
        let target = registry.variable(connection.target).component;
        let (group, a, b) = common_ancestor(&comps[src].ancestry, &comps[target].ancestry);
        edges[group].insert((a, b));
    }

    for (index, plan) in groups.iter_mut().enumerate() {
        let ordering = stable_topological_order(plan.children.len(), &edges[index]);
        plan.cyclic = !ordering.cycles.is_empty();
        if let Some(cycle) = ordering.cycles.first() {
            if matches!(plan.nonlinear, NonlinearSolver::RunOnce) {
                return Err(MdoError::UnresolvedCycle {
                    group: display_path(&plan.path).to_string(),
                    members: cycle
                        .iter()
                        .map(|&i| join_path(&plan.path, &plan.child_names[i]))
                        .collect(),
                });
            }
        }

        plan.order = match &defs[index].order {
            Some(names) => explicit_order(plan, names)?,
            None => ordering.order,
        };
        plan.linear = match &defs[index].linear_solver {
            Some(solver) => solver.clone(),
            None if plan.cyclic => LinearSolver::GaussSeidel(LgsSettings::default()),
            None => LinearSolver::RunOnce,
        };
    }
    Ok(())
}

fn explicit_order(plan: &GroupPlan, names: &[String]) -> Result<Vec<usize>> {
    let invalid = |reason: String| StructuralError::InvalidOrder {
        group: display_path(&plan.path).to_string(),
        reason,
    };
    let mut order = Vec::with_capacity(names.len());
    let mut seen = vec![false; plan.child_names.len()];
    for name in names {
        let i = plan
            .child_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| invalid(format!("'{name}' is not a subsystem")))?;
        if seen[i] {
            return Err(invalid(format!("'{name}' appears more than once")).into());
        }
        seen[i] = true;
        order.push(i);
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(invalid(format!("'{}' is missing", plan.child_names[missing])).into());
    }
    Ok(order)
}
