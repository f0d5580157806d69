use glam::Vec3;

/// Provides simple axis-aligned bounding box functionality.
///
/// An empty box has `min = +inf` and `max = -inf` so that merging with it is the identity.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    /// Location with the lowest X, Y, and Z coordinates in the axis-aligned bounding box.
    pub min: Vec3,
    /// Location with the highest X, Y, and Z coordinates in the axis-aligned bounding box.
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingBox {
    /// The identity element of [`BoundingBox::merge`].
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Constructs a bounding box from the specified minimum and maximum.
    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box containing exactly one point.
    #[inline]
    pub fn from_point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    /// Creates the smallest possible bounding box that contains a list of points.
    /// Returns [`BoundingBox::EMPTY`] for an empty list.
    pub fn from_points(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |mut bounds, &p| {
            bounds.extend(p);
            bounds
        })
    }

    /// Grows the box to contain `p`.
    #[inline(always)]
    pub fn extend(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grows the box to contain `other`.
    #[inline(always)]
    pub fn extend_box(&mut self, other: &BoundingBox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Computes a bounding box which contains two other bounding boxes.
    #[inline(always)]
    pub fn merge(&self, other: &BoundingBox) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// The part shared by both boxes. Empty when they are disjoint.
    #[inline(always)]
    pub fn intersection(&self, other: &BoundingBox) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Whether the boxes share at least one point.
    #[inline]
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Whether the box contains nothing (any `min > max`).
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    /// Non-empty and with finite corners.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.is_empty() && self.min.is_finite() && self.max.is_finite()
    }

    #[inline(always)]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline(always)]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Twice the center. Cheaper than [`BoundingBox::center`] and good enough for binning.
    #[inline(always)]
    pub fn center2(&self) -> Vec3 {
        self.min + self.max
    }

    /// Half of the surface area. Only ever used as a relative metric. Empty boxes report 0.
    #[inline(always)]
    pub fn half_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.size();
        d.x * d.y + d.y * d.z + d.z * d.x
    }

    /// Axis (0, 1 or 2) with the largest extent.
    #[inline]
    pub fn largest_axis(&self) -> usize {
        let d = self.size();
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Whether `other` lies entirely inside this box (boundaries inclusive).
    #[inline]
    pub fn encloses(&self, other: &BoundingBox) -> bool {
        other.is_empty() || (self.min.cmple(other.min).all() && self.max.cmpge(other.max).all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_merge_identity() {
        let b = BoundingBox::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(1.0, 3.0, 4.0));
        assert_eq!(BoundingBox::EMPTY.merge(&b), b);
        assert_eq!(b.merge(&BoundingBox::EMPTY), b);
        assert!(BoundingBox::EMPTY.is_empty());
        assert_eq!(BoundingBox::EMPTY.half_area(), 0.0);
    }

    #[test]
    fn test_intersection_and_overlap() {
        let a = BoundingBox::new(Vec3::ZERO, Vec3::splat(2.0));
        let b = BoundingBox::new(Vec3::ONE, Vec3::splat(3.0));
        assert_eq!(a.intersection(&b), BoundingBox::new(Vec3::ONE, Vec3::splat(2.0)));
        assert!(a.overlaps(&b));
        let far = BoundingBox::new(Vec3::splat(5.0), Vec3::splat(6.0));
        assert!(a.intersection(&far).is_empty());
        assert!(!a.overlaps(&far));
        assert!(!a.overlaps(&BoundingBox::EMPTY));
    }

    #[test]
    fn test_half_area() {
        let b = BoundingBox::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.half_area(), 2.0 + 6.0 + 3.0);
        assert_eq!(b.largest_axis(), 2);
    }

    #[test]
    fn test_containment() {
        let outer = BoundingBox::new(Vec3::ZERO, Vec3::splat(4.0));
        let inner = BoundingBox::new(Vec3::ONE, Vec3::splat(2.0));
        let straddling = BoundingBox::new(Vec3::splat(3.0), Vec3::splat(5.0));
        assert!(outer.encloses(&inner));
        assert!(outer.encloses(&outer));
        assert!(!outer.encloses(&straddling));
        assert!(!inner.encloses(&outer));
        assert!(outer.encloses(&BoundingBox::EMPTY));
    }

    #[test]
    fn test_from_points() {
        let b = BoundingBox::from_points(&[Vec3::X, Vec3::Y, -Vec3::Z]);
        assert_eq!(b.min, Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 0.0));
        assert!(BoundingBox::from_points(&[]).is_empty());
    }
}
