//! Variable registry: promoted names, connections and the flat layout of the
//! model's vectors.
//!
//! Outputs are laid out in the `u`/`r` vectors and inputs in the `p` vector,
//! both in depth-first component order, so every group owns a contiguous
//! slice of each.

use crate::error::{display_path, StructuralError};
use crate::group::ConnectSpec;
use crate::variable::{VarKind, VarMeta};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// One variable after setup.
#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    /// Absolute path, `"G.A.x"`.
    pub path: String,
    /// Name visible at the root after promotion.
    pub promoted: String,
    pub kind: VarKind,
    pub component: usize,
    pub shape: Vec<usize>,
    pub size: usize,
    /// Offset into `u` for outputs, into `p` for inputs.
    pub offset: usize,
    pub default: Vec<f64>,
    /// Name visible in the ancestor group at each depth, root first.
    pub(crate) scoped: Vec<String>,
}

impl VarInfo {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Resolved data edge: input `target` is fed by output `src`.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub src: usize,
    pub target: usize,
    pub src_indices: Option<Vec<usize>>,
}

impl Connection {
    /// `(u index, p index)` for every entry of the target.
    pub fn pairs<'a>(&'a self, registry: &'a Registry) -> impl Iterator<Item = (usize, usize)> + 'a {
        let src = &registry.vars[self.src];
        let target = &registry.vars[self.target];
        (0..target.size).map(move |k| {
            let s = match &self.src_indices {
                Some(indices) => indices[k],
                None => k,
            };
            (src.offset + s, target.offset + k)
        })
    }
}

/// One step of a component's ancestry: the subsystem name and its promotes.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub name: String,
    pub promotes: Vec<String>,
}

/// The explicit connections declared by one group.
pub(crate) struct GroupScope<'a> {
    pub path: &'a str,
    pub depth: usize,
    pub connections: &'a [ConnectSpec],
}

/// Placement of one component's variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ComponentVars {
    pub path: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub u_range: Range<usize>,
    pub p_range: Range<usize>,
}

/// `fnmatch`-style matching with `*` and `?`.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Names `local` takes in each ancestor scope, root first.
///
/// A name passes through a subsystem unchanged when one of the subsystem's
/// promotes matches it, and is prefixed with the subsystem name otherwise.
pub(crate) fn promote(chain: &[Scope], local: &str) -> Vec<String> {
    let mut scoped = vec![String::new(); chain.len()];
    let mut name = local.to_string();
    for (depth, scope) in chain.iter().enumerate().rev() {
        if !scope.promotes.iter().any(|p| glob_match(p, &name)) {
            name = format!("{}.{}", scope.name, name);
        }
        scoped[depth] = name.clone();
    }
    scoped
}

pub(crate) fn validate_name(name: &str) -> Result<(), StructuralError> {
    let reason = if name.is_empty() {
        "names cannot be empty"
    } else if name.contains('.') {
        "names cannot contain '.'"
    } else if name.contains(['*', '?']) {
        "names cannot contain wildcards"
    } else {
        return Ok(());
    };
    Err(StructuralError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

#[derive(Default)]
struct PromoteUse {
    path: String,
    patterns: Vec<String>,
    matched: Vec<bool>,
}

/// Collects declarations component by component.
#[derive(Default)]
pub(crate) struct RegistryBuilder {
    vars: Vec<VarInfo>,
    components: Vec<ComponentVars>,
    promote_uses: Vec<PromoteUse>,
    promote_index: HashMap<String, usize>,
    u_size: usize,
    p_size: usize,
}

impl RegistryBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers the declarations of component `component`, which must be
    /// the next one in depth-first order.
    pub(crate) fn register(
        &mut self,
        component: usize,
        path: &str,
        chain: &[Scope],
        vars: Vec<VarMeta>,
    ) -> Result<(), StructuralError> {
        debug_assert_eq!(component, self.components.len());
        let mut placement = ComponentVars {
            path: path.to_string(),
            u_range: self.u_size..self.u_size,
            p_range: self.p_size..self.p_size,
            ..ComponentVars::default()
        };

        let mut seen = BTreeMap::new();
        for meta in &vars {
            validate_name(&meta.name)?;
            let var_path = format!("{path}.{}", meta.name);
            if seen.insert(meta.name.clone(), ()).is_some() {
                return Err(StructuralError::DuplicateVariable { path: var_path });
            }
            if meta.value.shape.iter().product::<usize>() != meta.size() {
                return Err(StructuralError::InvalidValue {
                    path: var_path,
                    shape: meta.value.shape.clone(),
                    len: meta.size(),
                });
            }
        }

        // Outputs first so each component's u slice is contiguous.
        let ordered = vars
            .iter()
            .filter(|m| m.kind == VarKind::Output)
            .chain(vars.iter().filter(|m| m.kind == VarKind::Input));
        for meta in ordered {
            let scoped = promote(chain, &meta.name);
            self.note_promotes(chain, &meta.name);
            let offset = match meta.kind {
                VarKind::Output => {
                    self.u_size += meta.size();
                    self.u_size - meta.size()
                }
                VarKind::Input => {
                    self.p_size += meta.size();
                    self.p_size - meta.size()
                }
            };
            let index = self.vars.len();
            match meta.kind {
                VarKind::Output => placement.outputs.push(index),
                VarKind::Input => placement.inputs.push(index),
            }
            self.vars.push(VarInfo {
                path: format!("{path}.{}", meta.name),
                promoted: scoped.first().cloned().unwrap_or_else(|| meta.name.clone()),
                kind: meta.kind,
                component,
                shape: meta.value.shape.clone(),
                size: meta.size(),
                offset,
                default: meta.value.data.clone(),
                scoped,
            });
        }
        placement.u_range.end = self.u_size;
        placement.p_range.end = self.p_size;
        self.components.push(placement);
        Ok(())
    }

    /// Marks which promote patterns along `chain` the variable matches.
    fn note_promotes(&mut self, chain: &[Scope], local: &str) {
        let mut name = local.to_string();
        for depth in (0..chain.len()).rev() {
            let scope = &chain[depth];
            if !scope.promotes.is_empty() {
                let path = chain[..=depth]
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let slot = match self.promote_index.get(&path) {
                    Some(&slot) => slot,
                    None => {
                        self.promote_uses.push(PromoteUse {
                            path: path.clone(),
                            patterns: scope.promotes.clone(),
                            matched: vec![false; scope.promotes.len()],
                        });
                        self.promote_index.insert(path, self.promote_uses.len() - 1);
                        self.promote_uses.len() - 1
                    }
                };
                let usage = &mut self.promote_uses[slot];
                for (i, pattern) in usage.patterns.iter().enumerate() {
                    if glob_match(pattern, &name) {
                        usage.matched[i] = true;
                    }
                }
            }
            if !scope.promotes.iter().any(|p| glob_match(p, &name)) {
                name = format!("{}.{}", scope.name, name);
            }
        }
    }

    /// Builds the final edge set from promotions and explicit connections.
    pub(crate) fn resolve_connections(self, groups: &[GroupScope]) -> Result<Registry, StructuralError> {
        for usage in &self.promote_uses {
            if let Some(i) = usage.matched.iter().position(|m| !m) {
                return Err(StructuralError::UnmatchedPromotion {
                    path: usage.path.clone(),
                    pattern: usage.patterns[i].clone(),
                });
            }
        }

        let mut output_by_name: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, var) in self.vars.iter().enumerate() {
            if var.kind != VarKind::Output {
                continue;
            }
            if let Some(&first) = output_by_name.get(var.promoted.as_str()) {
                return Err(StructuralError::DuplicateOutput {
                    name: var.promoted.clone(),
                    first: self.vars[first].path.clone(),
                    second: var.path.clone(),
                });
            }
            output_by_name.insert(&var.promoted, index);
        }

        // Explicit connections: target var -> (source var, indices).
        let mut explicit: BTreeMap<usize, Vec<(usize, Option<Vec<usize>>)>> = BTreeMap::new();
        for group in groups {
            for spec in group.connections {
                let src = self.endpoint(group, &spec.src, &spec.target, VarKind::Output)?;
                let found = self.endpoints(group, &spec.target);
                let targets: Vec<usize> = found
                    .iter()
                    .copied()
                    .filter(|&i| self.vars[i].kind == VarKind::Input)
                    .collect();
                if targets.is_empty() {
                    return Err(match found.first() {
                        Some(&output) => StructuralError::InvalidConnection {
                            src: spec.src.clone(),
                            target: spec.target.clone(),
                            reason: format!("target '{}' is an output", self.vars[output].path),
                        },
                        None => StructuralError::UnknownEndpoint {
                            group: display_path(group.path).to_string(),
                            name: spec.target.clone(),
                        },
                    });
                }
                for target in targets {
                    explicit
                        .entry(target)
                        .or_default()
                        .push((src[0], spec.src_indices.clone()));
                }
            }
        }

        let mut connections = Vec::new();
        for (index, var) in self.vars.iter().enumerate() {
            if var.kind != VarKind::Input {
                continue;
            }
            let mut sources: Vec<(usize, Option<Vec<usize>>)> = Vec::new();
            let declared = explicit.remove(&index).unwrap_or_default();
            let implicit = output_by_name.get(var.promoted.as_str()).map(|&s| (s, None));
            for (src, indices) in declared.into_iter().chain(implicit) {
                if !sources.iter().any(|(s, _)| *s == src) {
                    sources.push((src, indices));
                }
            }
            let (src, src_indices) = match sources.len() {
                0 => {
                    return Err(StructuralError::BrokenPromotion {
                        target: var.path.clone(),
                        promoted: var.promoted.clone(),
                    })
                }
                1 => sources.remove(0),
                _ => {
                    return Err(StructuralError::MultipleSources {
                        target: var.path.clone(),
                        first: self.vars[sources[0].0].path.clone(),
                        second: self.vars[sources[1].0].path.clone(),
                    })
                }
            };
            self.check_shapes(src, index, src_indices.as_deref())?;
            connections.push(Connection {
                src,
                target: index,
                src_indices,
            });
        }

        let by_path = self
            .vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.path.clone(), i))
            .collect();
        let mut by_promoted: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, v) in self.vars.iter().enumerate() {
            by_promoted.entry(v.promoted.clone()).or_default().push(i);
        }
        let mut source_of = vec![None; self.vars.len()];
        for (ci, c) in connections.iter().enumerate() {
            source_of[c.target] = Some(ci);
        }

        Ok(Registry {
            vars: self.vars,
            components: self.components,
            connections,
            by_path,
            by_promoted,
            source_of,
            u_size: self.u_size,
            p_size: self.p_size,
        })
    }

    /// Variables inside `group` whose name at the group's depth is `name`.
    fn endpoints(&self, group: &GroupScope, name: &str) -> Vec<usize> {
        let prefix = format!("{}.", group.path);
        self.vars
            .iter()
            .enumerate()
            .filter(|(_, v)| group.path.is_empty() || v.path.starts_with(&prefix))
            .filter(|(_, v)| v.scoped.get(group.depth).map(String::as_str) == Some(name))
            .map(|(i, _)| i)
            .collect()
    }

    fn endpoint(
        &self,
        group: &GroupScope,
        src: &str,
        target: &str,
        kind: VarKind,
    ) -> Result<Vec<usize>, StructuralError> {
        let found = self.endpoints(group, src);
        if found.is_empty() {
            return Err(StructuralError::UnknownEndpoint {
                group: display_path(group.path).to_string(),
                name: src.to_string(),
            });
        }
        match found.iter().find(|&&i| self.vars[i].kind == kind) {
            Some(&i) => Ok(vec![i]),
            None => Err(StructuralError::InvalidConnection {
                src: src.to_string(),
                target: target.to_string(),
                reason: format!("source '{}' is an input", self.vars[found[0]].path),
            }),
        }
    }

    fn check_shapes(&self, src: usize, target: usize, indices: Option<&[usize]>) -> Result<(), StructuralError> {
        let (s, t) = (&self.vars[src], &self.vars[target]);
        let mismatch = |reason: String| StructuralError::ShapeMismatch {
            src: s.path.clone(),
            target: t.path.clone(),
            reason,
        };
        match indices {
            Some(indices) => {
                if indices.len() != t.size {
                    return Err(mismatch(format!(
                        "Size {} of the indexed sub-part of source '{}' must match the size '{}' of the target '{}'",
                        indices.len(),
                        s.path,
                        t.size,
                        t.path
                    )));
                }
                if let Some(&bad) = indices.iter().find(|&&i| i >= s.size) {
                    return Err(mismatch(format!(
                        "Index {bad} is out of range for source '{}' of size {} connected to '{}'",
                        s.path, s.size, t.path
                    )));
                }
            }
            None => {
                if s.shape != t.shape {
                    return Err(mismatch(format!(
                        "Shape {:?} of source '{}' must match the shape {:?} of the target '{}'",
                        s.shape, s.path, t.shape, t.path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Read-only after setup; shared by every solve.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    vars: Vec<VarInfo>,
    pub(crate) components: Vec<ComponentVars>,
    connections: Vec<Connection>,
    by_path: HashMap<String, usize>,
    by_promoted: BTreeMap<String, Vec<usize>>,
    source_of: Vec<Option<usize>>,
    u_size: usize,
    p_size: usize,
}

impl Registry {
    pub fn variables(&self) -> &[VarInfo] {
        &self.vars
    }

    pub fn variable(&self, index: usize) -> &VarInfo {
        &self.vars[index]
    }

    /// Connections, one per input, in input order.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn u_size(&self) -> usize {
        self.u_size
    }

    pub fn p_size(&self) -> usize {
        self.p_size
    }

    /// Looks a variable up by absolute path or promoted name. A promoted name
    /// shared by an output and inputs resolves to the output.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        if let Some(&i) = self.by_path.get(name) {
            return Some(i);
        }
        let candidates = self.by_promoted.get(name)?;
        candidates
            .iter()
            .copied()
            .find(|&i| self.vars[i].kind == VarKind::Output)
            .or_else(|| candidates.first().copied())
    }

    /// The connection feeding input `var`.
    pub fn source_of(&self, var: usize) -> Option<&Connection> {
        self.source_of.get(var).copied().flatten().map(|c| &self.connections[c])
    }

    /// Absolute `u` indices holding the value of `var`: its own entries for an
    /// output, the connected source entries for an input.
    pub fn source_entries(&self, var: usize) -> Vec<usize> {
        match self.vars[var].kind {
            VarKind::Output => self.vars[var].range().collect(),
            VarKind::Input => self
                .source_of(var)
                .map(|c| c.pairs(self).map(|(u, _)| u).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::VarValue;

    fn output(name: &str, value: impl Into<VarValue>) -> VarMeta {
        VarMeta {
            name: name.to_string(),
            kind: VarKind::Output,
            value: value.into(),
        }
    }

    fn input(name: &str, value: impl Into<VarValue>) -> VarMeta {
        VarMeta {
            name: name.to_string(),
            kind: VarKind::Input,
            value: value.into(),
        }
    }

    fn scope(name: &str, promotes: &[&str]) -> Scope {
        Scope {
            name: name.to_string(),
            promotes: promotes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("x?", "x1"));
        assert!(!glob_match("x?", "x12"));
        assert!(glob_match("a*b*c", "a--b--c"));
        assert!(!glob_match("a*b*c", "a--b--"));
        assert!(glob_match("y", "y"));
        assert!(!glob_match("y", "yy"));
    }

    #[test]
    fn promotion_walks_up_the_chain() {
        let chain = [scope("G", &["*"]), scope("A", &[])];
        assert_eq!(promote(&chain, "x"), vec!["A.x".to_string(), "A.x".to_string()]);
        let chain = [scope("G", &[]), scope("A", &["x"])];
        assert_eq!(promote(&chain, "x"), vec!["G.x".to_string(), "x".to_string()]);
    }

    #[test]
    fn promoted_names_connect_implicitly() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(0, "P", &[scope("P", &["x"])], vec![output("x", 3.0)])
            .unwrap();
        builder
            .register(1, "C", &[scope("C", &["x"])], vec![input("x", 0.0), output("y", 0.0)])
            .unwrap();
        let registry = builder.resolve_connections(&[]).unwrap();
        assert_eq!(registry.connections().len(), 1);
        let c = &registry.connections()[0];
        assert_eq!(registry.variable(c.src).path, "P.x");
        assert_eq!(registry.variable(c.target).path, "C.x");
        assert_eq!(registry.lookup("x"), Some(c.src));
        assert_eq!(registry.u_size(), 2);
        assert_eq!(registry.p_size(), 1);
    }

    #[test]
    fn duplicate_promoted_outputs_are_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "A", &[scope("A", &["y"])], vec![output("y", 0.0)]).unwrap();
        builder.register(1, "B", &[scope("B", &["*"])], vec![output("y", 0.0)]).unwrap();
        let err = builder.resolve_connections(&[]).unwrap_err();
        assert_eq!(
            err,
            StructuralError::DuplicateOutput {
                name: "y".into(),
                first: "A.y".into(),
                second: "B.y".into()
            }
        );
    }

    #[test]
    fn unconnected_inputs_are_broken_promotions() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "A", &[scope("A", &["x"])], vec![input("x", 0.0)]).unwrap();
        let err = builder.resolve_connections(&[]).unwrap_err();
        assert!(matches!(err, StructuralError::BrokenPromotion { ref target, ref promoted }
            if target == "A.x" && promoted == "x"));
    }

    #[test]
    fn unmatched_promotes_name_the_pattern() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "C", &[scope("C", &["q*"])], vec![output("y", 0.0)]).unwrap();
        let err = builder.resolve_connections(&[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'C' promotes 'q*' but has no variables matching that specification"
        );
    }

    #[test]
    fn index_size_mismatch_uses_source_index_wording() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "P", &[scope("P", &[])], vec![output("x", vec![1.0, 2.0, 3.0])]).unwrap();
        builder
            .register(1, "G.A", &[scope("G", &[]), scope("A", &[])], vec![input("x", vec![0.0, 0.0])])
            .unwrap();
        let connections = [ConnectSpec {
            src: "P.x".into(),
            target: "G.A.x".into(),
            src_indices: Some(vec![1]),
        }];
        let err = builder
            .resolve_connections(&[GroupScope {
                path: "",
                depth: 0,
                connections: &connections,
            }])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Size 1 of the indexed sub-part of source 'P.x' must match the size '2' of the target 'G.A.x'"
        );
    }

    #[test]
    fn indexed_connection_maps_entries() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "P", &[scope("P", &[])], vec![output("x", vec![1.0, 2.0, 3.0])]).unwrap();
        builder.register(1, "A", &[scope("A", &[])], vec![input("x", vec![0.0, 0.0])]).unwrap();
        let connections = [ConnectSpec {
            src: "P.x".into(),
            target: "A.x".into(),
            src_indices: Some(vec![2, 0]),
        }];
        let registry = builder
            .resolve_connections(&[GroupScope {
                path: "",
                depth: 0,
                connections: &connections,
            }])
            .unwrap();
        let pairs: Vec<_> = registry.connections()[0].pairs(&registry).collect();
        assert_eq!(pairs, vec![(2, 0), (0, 1)]);
        assert_eq!(registry.source_entries(registry.lookup("A.x").unwrap()), vec![2, 0]);
    }

    #[test]
    fn two_sources_for_one_input_are_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "P", &[scope("P", &["x"])], vec![output("x", 0.0)]).unwrap();
        builder.register(1, "Q", &[scope("Q", &[])], vec![output("z", 0.0)]).unwrap();
        builder.register(2, "A", &[scope("A", &["x"])], vec![input("x", 0.0)]).unwrap();
        let connections = [ConnectSpec {
            src: "Q.z".into(),
            target: "x".into(),
            src_indices: None,
        }];
        let err = builder
            .resolve_connections(&[GroupScope {
                path: "",
                depth: 0,
                connections: &connections,
            }])
            .unwrap_err();
        assert!(matches!(err, StructuralError::MultipleSources { .. }));
    }

    #[test]
    fn connecting_from_an_input_is_invalid() {
        let mut builder = RegistryBuilder::new();
        builder.register(0, "P", &[scope("P", &[])], vec![output("x", 0.0)]).unwrap();
        builder.register(1, "A", &[scope("A", &[])], vec![input("a", 0.0), input("b", 0.0)]).unwrap();
        let connections = [
            ConnectSpec {
                src: "P.x".into(),
                target: "A.a".into(),
                src_indices: None,
            },
            ConnectSpec {
                src: "A.a".into(),
                target: "A.b".into(),
                src_indices: None,
            },
        ];
        let err = builder
            .resolve_connections(&[GroupScope {
                path: "",
                depth: 0,
                connections: &connections,
            }])
            .unwrap_err();
        assert!(matches!(err, StructuralError::InvalidConnection { .. }));
    }

    #[test]
    fn invalid_names_and_values_fail_registration() {
        let mut builder = RegistryBuilder::new();
        let err = builder
            .register(0, "A", &[scope("A", &[])], vec![output("a.b", 0.0)])
            .unwrap_err();
        assert!(matches!(err, StructuralError::InvalidName { .. }));

        let mut builder = RegistryBuilder::new();
        let bad = VarMeta {
            name: "m".into(),
            kind: VarKind::Output,
            value: VarValue::shaped(&[2, 2], vec![0.0; 3]),
        };
        let err = builder.register(0, "A", &[scope("A", &[])], vec![bad]).unwrap_err();
        assert!(matches!(err, StructuralError::InvalidValue { len: 3, .. }));
    }
}
