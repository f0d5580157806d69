use glam::Vec3;

/// Geometry id reported for rays that hit nothing.
pub const INVALID_ID: u32 = u32::MAX;

/// A ray segment `origin + t * direction` for `t` in `[tnear, tfar]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub tnear: f32,
    /// Far end of the segment. Nearest-hit queries shrink it to the closest hit found.
    pub tfar: f32,
    /// Only geometries whose mask shares a bit with this value are tested.
    pub mask: u32,
    pub id: u32,
}

impl Default for Ray {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            direction: Vec3::Z,
            tnear: 0.0,
            tfar: f32::INFINITY,
            mask: u32::MAX,
            id: 0,
        }
    }
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            ..Default::default()
        }
    }

    pub fn with_segment(mut self, tnear: f32, tfar: f32) -> Self {
        self.tnear = tnear;
        self.tfar = tfar;
        self
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    #[inline(always)]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Index in `0..8` of the direction's sign octant. Bit `i` is set when axis `i` is negative.
    #[inline]
    pub fn octant(&self) -> usize {
        (self.direction.x < 0.0) as usize
            | ((self.direction.y < 0.0) as usize) << 1
            | ((self.direction.z < 0.0) as usize) << 2
    }

    /// Whether the segment can hit anything at all.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.origin.is_finite()
            && self.direction.is_finite()
            && self.direction != Vec3::ZERO
            && !self.tnear.is_nan()
            && !self.tfar.is_nan()
            && self.tnear <= self.tfar
    }
}

/// The closest intersection found along a ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub t: f32,
    /// Barycentric coordinates of the hit inside the primitive.
    pub u: f32,
    pub v: f32,
    /// Unnormalized geometric normal.
    pub ng: Vec3,
    pub geom_id: u32,
    pub prim_id: u32,
}

impl Default for Hit {
    fn default() -> Self {
        Self {
            t: f32::INFINITY,
            u: 0.0,
            v: 0.0,
            ng: Vec3::ZERO,
            geom_id: INVALID_ID,
            prim_id: INVALID_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octant() {
        assert_eq!(Ray::new(Vec3::ZERO, Vec3::ONE).octant(), 0);
        assert_eq!(Ray::new(Vec3::ZERO, Vec3::new(-1.0, 1.0, -1.0)).octant(), 0b101);
        assert_eq!(Ray::new(Vec3::ZERO, -Vec3::ONE).octant(), 7);
    }

    #[test]
    fn test_validity() {
        assert!(Ray::new(Vec3::ZERO, Vec3::X).is_valid());
        assert!(!Ray::new(Vec3::ZERO, Vec3::ZERO).is_valid());
        assert!(!Ray::new(Vec3::ZERO, Vec3::X).with_segment(2.0, 1.0).is_valid());
        assert!(!Ray::new(Vec3::splat(f32::NAN), Vec3::X).is_valid());
    }
}
