use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;

/// Box of one primitive plus the ids needed to find it again.
///
/// Laid out so that each corner shares 16 bytes with one id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PrimRef {
    pub lower: Vec3,
    pub geom_id: u32,
    pub upper: Vec3,
    pub prim_id: u32,
}

impl PrimRef {
    #[inline]
    pub fn new(bounds: BoundingBox, geom_id: u32, prim_id: u32) -> Self {
        Self {
            lower: bounds.min,
            geom_id,
            upper: bounds.max,
            prim_id,
        }
    }

    #[inline(always)]
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.lower, self.upper)
    }

    /// Twice the box center.
    #[inline(always)]
    pub fn center2(&self) -> Vec3 {
        self.lower + self.upper
    }

    #[inline(always)]
    pub fn center(&self) -> Vec3 {
        (self.lower + self.upper) * 0.5
    }
}

/// Number of `2^block_shift` sized blocks needed for `count` primitives.
#[inline(always)]
pub fn blocks(count: usize, block_shift: u32) -> usize {
    (count + (1 << block_shift) - 1) >> block_shift
}

/// Geometry bounds and centroid bounds of a primitive set.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CentGeom {
    pub geom_bounds: BoundingBox,
    /// Bounds of the doubled centers (`lower + upper`) of the members.
    pub cent_bounds: BoundingBox,
}

impl CentGeom {
    pub const EMPTY: Self = Self {
        geom_bounds: BoundingBox::EMPTY,
        cent_bounds: BoundingBox::EMPTY,
    };

    #[inline(always)]
    pub fn extend(&mut self, prim: &PrimRef) {
        self.geom_bounds.extend_box(&prim.bounds());
        self.cent_bounds.extend(prim.center2());
    }

    #[inline(always)]
    pub fn merge(&self, other: &CentGeom) -> Self {
        Self {
            geom_bounds: self.geom_bounds.merge(&other.geom_bounds),
            cent_bounds: self.cent_bounds.merge(&other.cent_bounds),
        }
    }
}

/// Bounds of a contiguous range `[begin, end)` of the primitive reference array.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimInfo {
    pub bounds: CentGeom,
    pub begin: usize,
    pub end: usize,
}

impl Default for PrimInfo {
    fn default() -> Self {
        Self::empty(0)
    }
}

impl PrimInfo {
    /// An empty range starting at `begin`.
    #[inline]
    pub fn empty(begin: usize) -> Self {
        Self {
            bounds: CentGeom::EMPTY,
            begin,
            end: begin,
        }
    }

    /// Computes the info of `prims`, which start at `begin` in the full array.
    pub fn from_prims(prims: &[PrimRef], begin: usize) -> Self {
        let mut info = Self::empty(begin);
        for prim in prims {
            info.add(prim);
        }
        info
    }

    /// Appends `prim` at the end of the range.
    #[inline(always)]
    pub fn add(&mut self, prim: &PrimRef) {
        self.bounds.extend(prim);
        self.end += 1;
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    #[inline(always)]
    pub fn geom_bounds(&self) -> BoundingBox {
        self.bounds.geom_bounds
    }

    #[inline(always)]
    pub fn cent_bounds(&self) -> BoundingBox {
        self.bounds.cent_bounds
    }

    #[inline(always)]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin..self.end
    }

    /// Combines two infos. The result starts at the smaller `begin` and holds both counts.
    #[inline]
    pub fn merge(&self, other: &PrimInfo) -> Self {
        let begin = self.begin.min(other.begin);
        Self {
            bounds: self.bounds.merge(&other.bounds),
            begin,
            end: begin + self.size() + other.size(),
        }
    }

    /// SAH cost of turning the whole range into one leaf, in units of the intersection cost.
    #[inline]
    pub fn leaf_sah(&self, block_shift: u32) -> f32 {
        self.geom_bounds().half_area() * blocks(self.size(), block_shift) as f32
    }
}

/// [`PrimInfo`] extended with the time information used by motion blur builds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrimInfoMB {
    pub info: PrimInfo,
    /// Union of the time ranges of all members.
    pub time_range: [f32; 2],
    pub max_time_segments: u32,
}

impl Default for PrimInfoMB {
    fn default() -> Self {
        Self::empty(0)
    }
}

impl PrimInfoMB {
    pub fn empty(begin: usize) -> Self {
        Self {
            info: PrimInfo::empty(begin),
            time_range: [f32::INFINITY, f32::NEG_INFINITY],
            max_time_segments: 0,
        }
    }

    pub fn add(&mut self, prim: &PrimRef, time_range: [f32; 2], time_segments: u32) {
        self.info.add(prim);
        self.time_range[0] = self.time_range[0].min(time_range[0]);
        self.time_range[1] = self.time_range[1].max(time_range[1]);
        self.max_time_segments = self.max_time_segments.max(time_segments);
    }

    pub fn merge(&self, other: &PrimInfoMB) -> Self {
        Self {
            info: self.info.merge(&other.info),
            time_range: [
                self.time_range[0].min(other.time_range[0]),
                self.time_range[1].max(other.time_range[1]),
            ],
            max_time_segments: self.max_time_segments.max(other.max_time_segments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_prim(rng: &mut StdRng, id: u32) -> PrimRef {
        let lower = Vec3::new(rng.gen(), rng.gen(), rng.gen()) * 100.0 - 50.0;
        let extent = Vec3::new(rng.gen(), rng.gen(), rng.gen()) * 5.0;
        PrimRef::new(BoundingBox::new(lower, lower + extent), 0, id)
    }

    #[test]
    fn test_merge_is_associative_and_commutative() {
        let mut rng = StdRng::seed_from_u64(11);
        let prims: Vec<PrimRef> = (0..90).map(|i| random_prim(&mut rng, i)).collect();
        let a = PrimInfo::from_prims(&prims[..30], 0);
        let b = PrimInfo::from_prims(&prims[30..60], 30);
        let c = PrimInfo::from_prims(&prims[60..], 60);

        let left = a.merge(&b).merge(&c);
        let right = a.merge(&b.merge(&c));
        let swapped = c.merge(&a).merge(&b);
        assert_eq!(left, right);
        assert_eq!(left, swapped);
        assert_eq!(left, PrimInfo::from_prims(&prims, 0));
        assert_eq!(left.size(), 90);
    }

    #[test]
    fn test_leaf_sah_rounds_to_blocks() {
        let prim = PrimRef::new(BoundingBox::new(Vec3::ZERO, Vec3::ONE), 0, 0);
        let info = PrimInfo::from_prims(&[prim; 5], 0);
        assert_eq!(info.leaf_sah(0), 3.0 * 5.0);
        // Five primitives occupy two blocks of four.
        assert_eq!(info.leaf_sah(2), 3.0 * 2.0);
        assert_eq!(blocks(8, 2), 2);
        assert_eq!(blocks(0, 2), 0);
    }

    #[test]
    fn test_motion_blur_merge() {
        let prim = PrimRef::new(BoundingBox::new(Vec3::ZERO, Vec3::ONE), 0, 0);
        let mut a = PrimInfoMB::empty(0);
        a.add(&prim, [0.0, 0.5], 2);
        let mut b = PrimInfoMB::empty(1);
        b.add(&prim, [0.25, 1.0], 7);
        let merged = a.merge(&b);
        assert_eq!(merged.time_range, [0.0, 1.0]);
        assert_eq!(merged.max_time_segments, 7);
        assert_eq!(merged.info.size(), 2);
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_center2_bounds() {
        let prim = PrimRef::new(BoundingBox::new(Vec3::ONE, Vec3::splat(3.0)), 1, 2);
        let info = PrimInfo::from_prims(&[prim], 0);
        assert_eq!(info.cent_bounds().min, Vec3::splat(4.0));
        assert_eq!(prim.center(), Vec3::splat(2.0));
    }
}
