use super::node::{intersects_ray, AlignedNode, NodeRef};
use super::ray_batcher::TreeRay;
use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;

/// Relative growth applied to the quantization step so that rounding never shrinks a box.
const SCALE_EPSILON: f32 = 1.0 / (1 << 20) as f32;

/// Inner node storing child boxes as 8-bit offsets from a per-node origin.
///
/// Decoding `start + code * scale` always yields a box enclosing the original child box.
/// Empty slots store lower code 255 and upper code 0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantizedNode<const N: usize> {
    pub children: [NodeRef; N],
    pub start: [f32; 3],
    pub scale: [f32; 3],
    /// `lower[axis][child]`
    pub lower: [[u8; N]; 3],
    pub upper: [[u8; N]; 3],
}

impl<const N: usize> Default for QuantizedNode<N> {
    fn default() -> Self {
        Self {
            children: [NodeRef::EMPTY; N],
            start: [0.0; 3],
            scale: [0.0; 3],
            lower: [[255; N]; 3],
            upper: [[0; N]; 3],
        }
    }
}

/// Evaluated in f64 so that spans wider than `f32::MAX` do not overflow before the add.
#[inline(always)]
fn decode(start: f32, scale: f32, code: u8) -> f32 {
    (start as f64 + code as f64 * scale as f64) as f32
}

impl<const N: usize> QuantizedNode<N> {
    /// Quantizes all child boxes of `node`.
    pub fn from_aligned(node: &AlignedNode<N>) -> Self {
        let mut quantized = Self {
            children: node.children,
            ..Default::default()
        };
        let valid: Vec<usize> = (0..N).filter(|&i| !node.children[i].is_empty()).collect();
        if valid.is_empty() {
            return quantized;
        }
        let axes = [
            (&node.lower_x, &node.upper_x),
            (&node.lower_y, &node.upper_y),
            (&node.lower_z, &node.upper_z),
        ];
        for (axis, (lowers, uppers)) in axes.into_iter().enumerate() {
            let start = valid.iter().map(|&i| lowers[i]).fold(f32::INFINITY, f32::min);
            let end = valid.iter().map(|&i| uppers[i]).fold(f32::NEG_INFINITY, f32::max);
            let diff = end as f64 - start as f64;
            let mut scale = ((diff * (1.0 + SCALE_EPSILON as f64) / 255.0) as f32).max(f32::MIN_POSITIVE);
            // The top code must reach the largest upper bound even after rounding.
            while decode(start, scale, 255) < end && scale.is_finite() {
                scale *= 1.0 + 1.0 / 1024.0;
            }
            quantized.start[axis] = start;
            quantized.scale[axis] = scale;

            for &i in &valid {
                let (lo, hi) = (lowers[i], uppers[i]);
                let offset = |x: f32| (x as f64 - start as f64) / scale as f64;
                let mut lower_code = offset(lo).floor().clamp(0.0, 255.0) as u8;
                let mut upper_code = offset(hi).ceil().clamp(0.0, 255.0) as u8;
                while lower_code > 0 && decode(start, scale, lower_code) > lo {
                    lower_code -= 1;
                }
                while upper_code < 255 && decode(start, scale, upper_code) < hi {
                    upper_code += 1;
                }
                quantized.lower[axis][i] = lower_code;
                quantized.upper[axis][i] = upper_code;
            }
        }
        quantized
    }

    /// Decoded, conservative box of child `i`. Empty for empty slots.
    #[inline]
    pub fn child_bounds(&self, i: usize) -> BoundingBox {
        if self.children[i].is_empty() {
            return BoundingBox::EMPTY;
        }
        let lower = |axis: usize| decode(self.start[axis], self.scale[axis], self.lower[axis][i]);
        let upper = |axis: usize| decode(self.start[axis], self.scale[axis], self.upper[axis][i]);
        BoundingBox::new(
            Vec3::new(lower(0), lower(1), lower(2)),
            Vec3::new(upper(0), upper(1), upper(2)),
        )
    }

    pub fn bounds(&self) -> BoundingBox {
        (0..N).fold(BoundingBox::EMPTY, |acc, i| acc.merge(&self.child_bounds(i)))
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// Re-encodes the node from fresh child boxes, keeping the children.
    pub fn requantize(&mut self, bounds: &[BoundingBox; N]) {
        let mut aligned = AlignedNode::<N>::default();
        for (i, b) in bounds.iter().enumerate() {
            aligned.set(i, self.children[i], b);
        }
        *self = Self::from_aligned(&aligned);
    }

    #[inline]
    pub fn intersect(&self, ray: &TreeRay, distances: &mut [f32; N]) -> u32 {
        let mut mask = 0;
        for i in 0..N {
            if self.children[i].is_empty() {
                break;
            }
            let bounds = self.child_bounds(i);
            if let Some(t) = intersects_ray(bounds.min, bounds.max, ray) {
                distances[i] = t;
                mask |= 1 << i;
            }
        }
        mask
    }
}
