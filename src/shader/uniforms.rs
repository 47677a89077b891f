//! Named uniform values and their std140 buffer image.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user-supplied uniform value as it arrives from JSON or the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniformValue {
    Bool(bool),
    Number(f64),
    Vector(Vec<f64>),
    Text(String),
}

impl UniformValue {
    /// Parses a raw `name=value` right-hand side: JSON first, then a float, then plain text.
    pub fn parse(raw: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<UniformValue>(raw) {
            return value;
        }
        match raw.trim().parse::<f64>() {
            Ok(number) => UniformValue::Number(number),
            Err(_) => UniformValue::Text(raw.to_string()),
        }
    }

    /// Float components of this value. Numeric-looking text is coerced; other text has none.
    pub fn components(&self) -> Option<Vec<f32>> {
        match self {
            UniformValue::Bool(flag) => Some(vec![if *flag { 1.0 } else { 0.0 }]),
            UniformValue::Number(number) => Some(vec![*number as f32]),
            UniformValue::Vector(values) => Some(values.iter().map(|v| *v as f32).collect()),
            UniformValue::Text(text) => text.trim().parse::<f64>().ok().map(|n| vec![n as f32]),
        }
    }
}

/// Scalar type of a uniform block member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Int,
    Uint,
}

/// Location of one member inside the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSlot {
    pub offset: u32,
    pub kind: UniformKind,
    pub components: u32,
}

/// Reflected layout of the shader's uniform block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    slots: BTreeMap<String, UniformSlot>,
    size: u32,
}

impl UniformLayout {
    pub fn new(slots: BTreeMap<String, UniformSlot>, size: u32) -> Self {
        Self { slots, size }
    }

    pub fn get(&self, name: &str) -> Option<&UniformSlot> {
        self.slots.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Buffer size in bytes, rounded up to 16 and never zero.
    pub fn buffer_size(&self) -> u32 {
        self.size.max(16).div_ceil(16) * 16
    }
}

/// CPU copy of the uniform buffer contents.
#[derive(Debug, Clone)]
pub struct UniformBlock {
    layout: UniformLayout,
    data: Vec<u8>,
}

impl UniformBlock {
    pub fn new(layout: UniformLayout) -> Self {
        let data = vec![0u8; layout.buffer_size() as usize];
        Self { layout, data }
    }

    pub fn layout(&self) -> &UniformLayout {
        &self.layout
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writes `values` into `name`. Returns `Ok(false)` if the shader has no such uniform.
    pub fn set(&mut self, name: &str, values: &[f32]) -> Result<bool> {
        let Some(slot) = self.layout.get(name).copied() else {
            return Ok(false);
        };
        if values.len() != slot.components as usize {
            return Err(anyhow!(
                "uniform {} expects {} component(s), got {}",
                name,
                slot.components,
                values.len()
            ));
        }
        for (i, value) in values.iter().enumerate() {
            let start = slot.offset as usize + i * 4;
            let bytes = match slot.kind {
                UniformKind::Float => value.to_le_bytes(),
                UniformKind::Int => (value.round() as i32).to_le_bytes(),
                UniformKind::Uint => (value.max(0.0).round() as u32).to_le_bytes(),
            };
            self.data[start..start + 4].copy_from_slice(&bytes);
        }
        Ok(true)
    }

    /// Reads back a member as floats; used by tests and diagnostics.
    pub fn get(&self, name: &str) -> Option<Vec<f32>> {
        let slot = self.layout.get(name)?;
        let mut out = Vec::with_capacity(slot.components as usize);
        for i in 0..slot.components as usize {
            let start = slot.offset as usize + i * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.data[start..start + 4]);
            out.push(match slot.kind {
                UniformKind::Float => f32::from_le_bytes(raw),
                UniformKind::Int => i32::from_le_bytes(raw) as f32,
                UniformKind::Uint => u32::from_le_bytes(raw) as f32,
            });
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> UniformLayout {
        let mut slots = BTreeMap::new();
        slots.insert("iResolution".to_string(), UniformSlot { offset: 0, kind: UniformKind::Float, components: 2 });
        slots.insert("iTime".to_string(), UniformSlot { offset: 8, kind: UniformKind::Float, components: 1 });
        slots.insert("mode".to_string(), UniformSlot { offset: 12, kind: UniformKind::Int, components: 1 });
        UniformLayout::new(slots, 16)
    }

    #[test]
    fn parse_follows_json_then_float_then_text() {
        assert_eq!(UniformValue::parse("[1, 2.5]"), UniformValue::Vector(vec![1.0, 2.5]));
        assert_eq!(UniformValue::parse("0.75"), UniformValue::Number(0.75));
        assert_eq!(UniformValue::parse(" 3 "), UniformValue::Number(3.0));
        assert_eq!(UniformValue::parse("warm"), UniformValue::Text("warm".into()));
        assert_eq!(UniformValue::parse("true"), UniformValue::Bool(true));
    }

    #[test]
    fn numeric_text_is_coerced() {
        assert_eq!(UniformValue::Text("1.5".into()).components(), Some(vec![1.5]));
        assert_eq!(UniformValue::Text("warm".into()).components(), None);
    }

    #[test]
    fn set_writes_declared_members_only() {
        let mut block = UniformBlock::new(layout());
        assert!(block.set("iTime", &[2.5]).unwrap());
        assert!(block.set("iResolution", &[1280.0, 720.0]).unwrap());
        assert!(block.set("mode", &[3.0]).unwrap());
        assert!(!block.set("bassLevel", &[0.4]).unwrap());

        assert_eq!(block.get("iTime"), Some(vec![2.5]));
        assert_eq!(block.get("iResolution"), Some(vec![1280.0, 720.0]));
        assert_eq!(block.get("mode"), Some(vec![3.0]));
        assert_eq!(&block.bytes()[12..16], &3i32.to_le_bytes());
    }

    #[test]
    fn component_mismatch_is_an_error() {
        let mut block = UniformBlock::new(layout());
        assert!(block.set("iTime", &[1.0, 2.0]).is_err());
    }

    #[test]
    fn buffer_size_is_padded() {
        assert_eq!(UniformLayout::default().buffer_size(), 16);
        assert_eq!(UniformLayout::new(BTreeMap::new(), 20).buffer_size(), 32);
    }
}
