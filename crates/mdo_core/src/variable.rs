//! Variable declarations and the name-indexed views components read and
//! write through.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// A parameter, fed by exactly one output.
    Input,
    /// An output or state owned by its component.
    Output,
}

/// A default value together with its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarValue {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl VarValue {
    pub fn shaped(shape: &[usize], data: Vec<f64>) -> Self {
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let size = shape.iter().product();
        Self::shaped(shape, vec![0.0; size])
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        Self::shaped(&[1], vec![value])
    }
}

impl From<Vec<f64>> for VarValue {
    fn from(data: Vec<f64>) -> Self {
        Self::shaped(&[data.len()], data)
    }
}

impl From<&[f64]> for VarValue {
    fn from(data: &[f64]) -> Self {
        Self::from(data.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for VarValue {
    fn from(data: [f64; N]) -> Self {
        Self::from(data.to_vec())
    }
}

/// One declared variable, as returned by a component's `setup`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarMeta {
    pub name: String,
    pub kind: VarKind,
    pub value: VarValue,
}

impl VarMeta {
    pub fn size(&self) -> usize {
        self.value.data.len()
    }
}

/// Collects the variables a component declares during `setup`.
#[derive(Debug, Default)]
pub struct VarDeclarations {
    vars: Vec<VarMeta>,
}

impl VarDeclarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: &str, value: impl Into<VarValue>) -> &mut Self {
        self.push(name, VarKind::Input, value.into())
    }

    pub fn add_output(&mut self, name: &str, value: impl Into<VarValue>) -> &mut Self {
        self.push(name, VarKind::Output, value.into())
    }

    fn push(&mut self, name: &str, kind: VarKind, value: VarValue) -> &mut Self {
        self.vars.push(VarMeta {
            name: name.to_string(),
            kind,
            value,
        });
        self
    }

    pub fn vars(&self) -> &[VarMeta] {
        &self.vars
    }

    pub(crate) fn into_vars(self) -> Vec<VarMeta> {
        self.vars
    }
}

/// Position of one variable inside a component's slice of a flat vector.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LocalVar {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub shape: Vec<usize>,
}

pub(crate) fn find_local<'a>(layout: &'a [LocalVar], name: &str) -> Option<&'a LocalVar> {
    layout.iter().find(|v| v.name == name)
}

fn missing(name: &str, layout: &[LocalVar]) -> ! {
    let known: Vec<&str> = layout.iter().map(|v| v.name.as_str()).collect();
    panic!("no variable named '{name}' in this view (declared: {known:?})")
}

/// Read-only view of a component's inputs, outputs or residuals.
#[derive(Debug, Clone, Copy)]
pub struct Values<'a> {
    layout: &'a [LocalVar],
    data: &'a [f64],
}

impl<'a> Values<'a> {
    pub(crate) fn new(layout: &'a [LocalVar], data: &'a [f64]) -> Self {
        Self { layout, data }
    }

    pub fn get(&self, name: &str) -> Option<&'a [f64]> {
        find_local(self.layout, name).map(|v| &self.data[v.offset..v.offset + v.size])
    }

    /// First entry of the named variable.
    pub fn scalar(&self, name: &str) -> f64 {
        self[name][0]
    }

    pub fn vector(&self, name: &str) -> DVector<f64> {
        DVector::from_column_slice(&self[name])
    }

    pub fn shape(&self, name: &str) -> Option<&'a [usize]> {
        find_local(self.layout, name).map(|v| v.shape.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &'a str> {
        self.layout.iter().map(|v| v.name.as_str())
    }

    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }
}

impl<'a> Index<&str> for Values<'a> {
    type Output = [f64];

    fn index(&self, name: &str) -> &[f64] {
        match self.get(name) {
            Some(values) => values,
            None => missing(name, self.layout),
        }
    }
}

/// Writable view of a component's outputs, residuals or derivative vectors.
#[derive(Debug)]
pub struct ValuesMut<'a> {
    layout: &'a [LocalVar],
    data: &'a mut [f64],
}

impl<'a> ValuesMut<'a> {
    pub(crate) fn new(layout: &'a [LocalVar], data: &'a mut [f64]) -> Self {
        Self { layout, data }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        find_local(self.layout, name).map(|v| &self.data[v.offset..v.offset + v.size])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        let var = find_local(self.layout, name)?;
        Some(&mut self.data[var.offset..var.offset + var.size])
    }

    pub fn scalar(&self, name: &str) -> f64 {
        self[name][0]
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) {
        self[name][0] = value;
    }

    /// Copies `values` into the named variable; lengths must agree.
    pub fn set(&mut self, name: &str, values: &[f64]) {
        self[name].copy_from_slice(values);
    }

    pub fn vector(&self, name: &str) -> DVector<f64> {
        DVector::from_column_slice(&self[name])
    }

    pub fn as_values(&self) -> Values<'_> {
        Values::new(self.layout, &*self.data)
    }

    pub fn as_slice(&self) -> &[f64] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut *self.data
    }
}

impl<'a> Index<&str> for ValuesMut<'a> {
    type Output = [f64];

    fn index(&self, name: &str) -> &[f64] {
        match find_local(self.layout, name) {
            Some(v) => &self.data[v.offset..v.offset + v.size],
            None => missing(name, self.layout),
        }
    }
}

impl<'a> IndexMut<&str> for ValuesMut<'a> {
    fn index_mut(&mut self, name: &str) -> &mut [f64] {
        match find_local(self.layout, name) {
            Some(v) => &mut self.data[v.offset..v.offset + v.size],
            None => missing(name, self.layout),
        }
    }
}

/// Lays variables out back to back, in declaration order.
pub(crate) fn layout_of<'a>(vars: impl Iterator<Item = &'a VarMeta>) -> Vec<LocalVar> {
    let mut offset = 0;
    vars.map(|meta| {
        let var = LocalVar {
            name: meta.name.clone(),
            offset,
            size: meta.size(),
            shape: meta.value.shape.clone(),
        };
        offset += var.size;
        var
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> Vec<LocalVar> {
        let mut decl = VarDeclarations::new();
        decl.add_input("x", 1.0).add_input("v", vec![1.0, 2.0, 3.0]);
        layout_of(decl.vars().iter())
    }

    #[test]
    fn layout_is_contiguous_in_declaration_order() {
        let layout = sample_layout();
        assert_eq!(layout[0].offset, 0);
        assert_eq!(layout[1].offset, 1);
        assert_eq!(layout[1].size, 3);
        assert_eq!(layout[1].shape, vec![3]);
    }

    #[test]
    fn views_index_by_name() {
        let layout = sample_layout();
        let mut data = vec![0.5, 1.0, 2.0, 3.0];
        {
            let view = Values::new(&layout, &data);
            assert_eq!(view.scalar("x"), 0.5);
            assert_eq!(&view["v"], &[1.0, 2.0, 3.0]);
            assert!(view.get("missing").is_none());
        }
        let mut view = ValuesMut::new(&layout, &mut data);
        view.set("v", &[4.0, 5.0, 6.0]);
        view.set_scalar("x", -1.0);
        assert_eq!(data, vec![-1.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "no variable named 'y'")]
    fn indexing_unknown_name_panics() {
        let layout = sample_layout();
        let data = vec![0.0; 4];
        let view = Values::new(&layout, &data);
        let _ = &view["y"];
    }
}
