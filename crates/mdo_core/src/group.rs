//! Hierarchical assembly: the user-facing `Group` tree and the ordering of a
//! group's children.

use crate::component::{Component, ExplicitComponent, ImplicitComponent};
use crate::solvers::{LinearSolver, NonlinearSolver};
use std::collections::{BTreeSet, BinaryHeap};
use std::cmp::Reverse;

/// A child of a group: either a leaf component or a nested group.
#[derive(Debug)]
pub enum System {
    Component(Component),
    Group(Group),
}

impl From<Component> for System {
    fn from(component: Component) -> Self {
        System::Component(component)
    }
}

impl From<Group> for System {
    fn from(group: Group) -> Self {
        System::Group(group)
    }
}

#[derive(Debug)]
pub struct Subsystem {
    pub name: String,
    pub system: System,
    /// Variable names (or `*`/`?` patterns) promoted into the parent scope.
    pub promotes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectSpec {
    pub src: String,
    pub target: String,
    pub src_indices: Option<Vec<usize>>,
}

/// Composite node of the model tree.
#[derive(Debug, Default)]
pub struct Group {
    subsystems: Vec<Subsystem>,
    connections: Vec<ConnectSpec>,
    order: Option<Vec<String>>,
    nonlinear_solver: Option<NonlinearSolver>,
    linear_solver: Option<LinearSolver>,
    parallel: bool,
    min_workers: usize,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child. Name clashes are reported by `setup()`.
    pub fn add(&mut self, name: &str, system: impl Into<System>, promotes: &[&str]) -> &mut Self {
        self.subsystems.push(Subsystem {
            name: name.to_string(),
            system: system.into(),
            promotes: promotes.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn add_explicit(
        &mut self,
        name: &str,
        component: impl ExplicitComponent + 'static,
        promotes: &[&str],
    ) -> &mut Self {
        self.add(name, Component::explicit(component), promotes)
    }

    pub fn add_implicit(
        &mut self,
        name: &str,
        component: impl ImplicitComponent + 'static,
        promotes: &[&str],
    ) -> &mut Self {
        self.add(name, Component::implicit(component), promotes)
    }

    /// Connects output `src` to input `target`, both named as seen from this
    /// group (`"A.y"`, or a promoted name).
    pub fn connect(&mut self, src: &str, target: &str) -> &mut Self {
        self.connections.push(ConnectSpec {
            src: src.to_string(),
            target: target.to_string(),
            src_indices: None,
        });
        self
    }

    /// Like [`Group::connect`], feeding entry `k` of the target from entry
    /// `src_indices[k]` of the flattened source.
    pub fn connect_indices(&mut self, src: &str, target: &str, src_indices: &[usize]) -> &mut Self {
        self.connections.push(ConnectSpec {
            src: src.to_string(),
            target: target.to_string(),
            src_indices: Some(src_indices.to_vec()),
        });
        self
    }

    /// Overrides the dependency-derived execution order. Must name every
    /// child exactly once.
    pub fn set_order(&mut self, order: &[&str]) -> &mut Self {
        self.order = Some(order.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn set_nonlinear_solver(&mut self, solver: NonlinearSolver) -> &mut Self {
        self.nonlinear_solver = Some(solver);
        self
    }

    pub fn set_linear_solver(&mut self, solver: LinearSolver) -> &mut Self {
        self.linear_solver = Some(solver);
        self
    }

    /// Children of a parallel group run on disjoint worker ranges.
    pub fn set_parallel(&mut self, parallel: bool) -> &mut Self {
        self.parallel = parallel;
        self
    }

    pub fn set_min_workers(&mut self, workers: usize) -> &mut Self {
        self.min_workers = workers;
        self
    }

    pub fn subsystems(&self) -> &[Subsystem] {
        &self.subsystems
    }

    /// Moves the components out of the tree, leaving a structural
    /// description that refers to them by index (depth-first order).
    pub(crate) fn detach(self, components: &mut Vec<Component>) -> GroupDef {
        let children = self
            .subsystems
            .into_iter()
            .map(|sub| {
                let node = match sub.system {
                    System::Component(component) => {
                        components.push(component);
                        NodeDef::Leaf(components.len() - 1)
                    }
                    System::Group(group) => NodeDef::Group(group.detach(components)),
                };
                ChildDef {
                    name: sub.name,
                    promotes: sub.promotes,
                    node,
                }
            })
            .collect();
        GroupDef {
            children,
            connections: self.connections,
            order: self.order,
            nonlinear_solver: self.nonlinear_solver,
            linear_solver: self.linear_solver,
            parallel: self.parallel,
            min_workers: self.min_workers,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GroupDef {
    pub children: Vec<ChildDef>,
    pub connections: Vec<ConnectSpec>,
    pub order: Option<Vec<String>>,
    pub nonlinear_solver: Option<NonlinearSolver>,
    pub linear_solver: Option<LinearSolver>,
    pub parallel: bool,
    pub min_workers: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ChildDef {
    pub name: String,
    pub promotes: Vec<String>,
    pub node: NodeDef,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeDef {
    Leaf(usize),
    Group(GroupDef),
}

/// Result of ordering the children of one group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Ordering {
    pub order: Vec<usize>,
    /// Strongly connected sets of children (size > 1, or a self loop), each
    /// in declaration order.
    pub cycles: Vec<Vec<usize>>,
}

/// Stable topological order of `n` nodes under precedence `edges` (a, b),
/// meaning `a` must run before `b`.
///
/// Cycles are collapsed into strongly connected components and ordered as a
/// unit; whenever several nodes are ready, the one declared first wins.
pub(crate) fn stable_topological_order(n: usize, edges: &BTreeSet<(usize, usize)>) -> Ordering {
    let mut adjacency = vec![Vec::new(); n];
    for &(a, b) in edges {
        adjacency[a].push(b);
    }
    let components = tarjan(n, &adjacency);

    let mut comp_of = vec![0; n];
    for (ci, members) in components.iter().enumerate() {
        for &m in members {
            comp_of[m] = ci;
        }
    }

    let mut indegree = vec![0usize; components.len()];
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
    for &(a, b) in edges {
        let (ca, cb) = (comp_of[a], comp_of[b]);
        if ca != cb && successors[ca].insert(cb) {
            indegree[cb] += 1;
        }
    }

    // Components are keyed by their first-declared member.
    let key = |ci: usize| components[ci][0];
    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..components.len())
        .filter(|&ci| indegree[ci] == 0)
        .map(|ci| Reverse((key(ci), ci)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, ci))) = ready.pop() {
        order.extend(components[ci].iter().copied());
        for &next in &successors[ci] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((key(next), next)));
            }
        }
    }

    let cycles = components
        .iter()
        .filter(|members| members.len() > 1 || edges.contains(&(members[0], members[0])))
        .cloned()
        .collect();

    Ordering { order, cycles }
}

/// Tarjan's strongly connected components; members sorted ascending.
fn tarjan(n: usize, adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State<'a> {
        adjacency: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        out: Vec<Vec<usize>>,
    }

    fn visit(s: &mut State, v: usize) {
        s.index[v] = Some(s.next);
        s.lowlink[v] = s.next;
        s.next += 1;
        s.stack.push(v);
        s.on_stack[v] = true;

        for i in 0..s.adjacency[v].len() {
            let w = s.adjacency[v][i];
            match s.index[w] {
                None => {
                    visit(s, w);
                    s.lowlink[v] = s.lowlink[v].min(s.lowlink[w]);
                }
                Some(wi) if s.on_stack[w] => s.lowlink[v] = s.lowlink[v].min(wi),
                Some(_) => {}
            }
        }

        if Some(s.lowlink[v]) == s.index[v] {
            let mut members = Vec::new();
            while let Some(w) = s.stack.pop() {
                s.on_stack[w] = false;
                members.push(w);
                if w == v {
                    break;
                }
            }
            members.sort_unstable();
            s.out.push(members);
        }
    }

    let mut state = State {
        adjacency,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for v in 0..n {
        if state.index[v].is_none() {
            visit(&mut state, v);
        }
    }
    state.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn edges(list: &[(usize, usize)]) -> BTreeSet<(usize, usize)> {
        list.iter().copied().collect()
    }

    #[test]
    fn independent_nodes_keep_declaration_order() {
        let ordering = stable_topological_order(4, &BTreeSet::new());
        assert_eq!(ordering.order, vec![0, 1, 2, 3]);
        assert!(ordering.cycles.is_empty());
    }

    #[test]
    fn dependencies_move_consumers_after_producers() {
        // 0 reads from 2, 1 is independent.
        let ordering = stable_topological_order(3, &edges(&[(2, 0)]));
        assert_eq!(ordering.order, vec![1, 2, 0]);
    }

    #[test]
    fn cycles_are_grouped_and_reported() {
        let ordering = stable_topological_order(4, &edges(&[(1, 2), (2, 1), (0, 1), (2, 3)]));
        assert_eq!(ordering.order, vec![0, 1, 2, 3]);
        assert_eq!(ordering.cycles, vec![vec![1, 2]]);
    }

    #[test]
    fn self_loops_count_as_cycles() {
        let ordering = stable_topological_order(2, &edges(&[(1, 1)]));
        assert_eq!(ordering.order, vec![0, 1]);
        assert_eq!(ordering.cycles, vec![vec![1]]);
    }

    #[test]
    fn detach_numbers_components_depth_first() {
        use crate::component::IndepVarComp;

        let mut inner = Group::new();
        inner.add_explicit("b", IndepVarComp::new().with_output("y", 1.0), &[]);
        let mut root = Group::new();
        root.add_explicit("a", IndepVarComp::new().with_output("x", 1.0), &[])
            .add("g", inner, &["*"])
            .add_explicit("c", IndepVarComp::new().with_output("z", 1.0), &[]);

        let mut components = Vec::new();
        let def = root.detach(&mut components);
        assert_eq!(components.len(), 3);
        assert!(matches!(def.children[0].node, NodeDef::Leaf(0)));
        match &def.children[1].node {
            NodeDef::Group(g) => assert!(matches!(g.children[0].node, NodeDef::Leaf(1))),
            NodeDef::Leaf(_) => panic!("expected a group"),
        }
        assert!(matches!(def.children[2].node, NodeDef::Leaf(2)));
        assert_eq!(def.children[1].promotes, vec!["*".to_string()]);
    }

    fn dag() -> impl Strategy<Value = (usize, BTreeSet<(usize, usize)>)> {
        (1usize..9).prop_flat_map(|n| {
            let pairs = proptest::collection::vec((0..n, 0..n), 0..20);
            (Just(n), pairs).prop_map(|(n, pairs)| {
                // Orient every edge from lower to higher label after a fixed
                // relabelling so the graph stays acyclic.
                let set = pairs
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| {
                        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                        (n - 1 - hi, n - 1 - lo)
                    })
                    .collect();
                (n, set)
            })
        })
    }

    proptest! {
        #[test]
        fn order_is_a_topological_permutation((n, edges) in dag()) {
            let ordering = stable_topological_order(n, &edges);
            let mut position = vec![usize::MAX; n];
            for (i, &node) in ordering.order.iter().enumerate() {
                position[node] = i;
            }
            prop_assert!(position.iter().all(|&p| p < n));
            for &(a, b) in &edges {
                prop_assert!(position[a] < position[b]);
            }
            prop_assert!(ordering.cycles.is_empty());
        }

        #[test]
        fn order_is_the_smallest_valid_sequence((n, edges) in dag()) {
            // Lexicographically smallest order: always place the
            // first-declared node whose producers are all placed.
            let mut placed = vec![false; n];
            let mut expected = Vec::with_capacity(n);
            while expected.len() < n {
                let next = (0..n)
                    .find(|&v| !placed[v] && edges.iter().all(|&(a, b)| b != v || placed[a]))
                    .unwrap();
                placed[next] = true;
                expected.push(next);
            }
            prop_assert_eq!(stable_topological_order(n, &edges).order, expected);
        }
    }
}
