// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Flat offsets of the supported layers inside one parameter vector.

use std::ops::Range;

/// Position of one supported layer in the flat parameter vector. The weight
/// occupies `offset..offset + weight_len`, the bias follows immediately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSlot {
    pub index: usize,
    pub name: String,
    pub offset: usize,
    pub weight_shape: (usize, usize),
    pub bias_shape: Option<(usize, usize)>,
}

impl LayerSlot {
    pub fn weight_len(&self) -> usize {
        self.weight_shape.0 * self.weight_shape.1
    }

    pub fn bias_len(&self) -> usize {
        self.bias_shape.map_or(0, |(rows, cols)| rows * cols)
    }

    /// Scalar parameters owned by the layer.
    pub fn len(&self) -> usize {
        self.weight_len() + self.bias_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }

    pub fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        std::iter::once(self.weight_shape)
            .chain(self.bias_shape)
            .collect()
    }
}

/// Offset table built once per generator. Slot `i` belongs to the layer
/// tagged `i` by the instrumentation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterLayout {
    slots: Vec<LayerSlot>,
    total: usize,
}

impl ParameterLayout {
    /// Lays out layers in the given order. Each entry lists the layer name and
    /// its parameter shapes, weight first and optional bias second.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<(usize, usize)>)>,
    {
        let mut slots = Vec::new();
        let mut offset = 0;
        for (index, (name, shapes)) in layers.into_iter().enumerate() {
            let mut shapes = shapes.into_iter();
            let weight_shape = shapes.next().unwrap_or((0, 0));
            let slot = LayerSlot {
                index,
                name,
                offset,
                weight_shape,
                bias_shape: shapes.next(),
            };
            offset += slot.len();
            slots.push(slot);
        }
        Self {
            slots,
            total: offset,
        }
    }

    pub fn slots(&self) -> &[LayerSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&LayerSlot> {
        self.slots.get(index)
    }

    /// Number of laid-out layers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Length of the flat parameter vector.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Concatenated parameter shapes in flat order.
    pub fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        self.slots
            .iter()
            .flat_map(LayerSlot::parameter_shapes)
            .collect()
    }

    /// Maps a flat index to `(layer, offset inside the layer)`.
    pub fn locate(&self, flat_index: usize) -> Option<(usize, usize)> {
        if flat_index >= self.total {
            return None;
        }
        let position = self
            .slots
            .partition_point(|slot| slot.offset + slot.len() <= flat_index);
        let slot = self.slots.get(position)?;
        Some((slot.index, flat_index - slot.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ParameterLayout {
        ParameterLayout::new(vec![
            ("fc1".to_string(), vec![(3, 2), (1, 2)]),
            ("conv".to_string(), vec![(4, 9)]),
            ("fc2".to_string(), vec![(2, 1), (1, 1)]),
        ])
    }

    #[test]
    fn offsets_follow_declaration_order() {
        let layout = layout();
        let offsets: Vec<_> = layout.slots().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 8, 44]);
        assert_eq!(layout.total(), 47);
        assert_eq!(layout.slot(1).unwrap().bias_len(), 0);
        assert_eq!(layout.slot(2).unwrap().range(), 44..47);
    }

    #[test]
    fn locate_inverts_offsets() {
        let layout = layout();
        assert_eq!(layout.locate(0), Some((0, 0)));
        assert_eq!(layout.locate(7), Some((0, 7)));
        assert_eq!(layout.locate(8), Some((1, 0)));
        assert_eq!(layout.locate(46), Some((2, 2)));
        assert_eq!(layout.locate(47), None);
    }

    #[test]
    fn shapes_concatenate_in_flat_order() {
        assert_eq!(
            layout().parameter_shapes(),
            vec![(3, 2), (1, 2), (4, 9), (2, 1), (1, 1)]
        );
    }
}
