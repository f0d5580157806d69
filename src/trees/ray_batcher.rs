//! Ray representations used by traversal, and coherent traversal of ray packets and streams.

use super::node::NodeKind;
use super::node::NodeRef;
use super::tree::Bvh;
use super::tree_ray_cast::{sort_hit_children, TraversalStack};
use crate::primitives::Primitive;
use crate::ray::{Hit, Ray};
use crate::scene::GeometryProvider;
use glam::Vec3;

/// Packet width used when tracing streams.
pub const STREAM_PACKET_WIDTH: usize = 8;

/// Reciprocal of `direction` with near zero components clamped to an enormous magnitude.
///
/// Intervals computed from a clamped component are huge rather than infinite, so the slab test
/// never produces NaN for axis-parallel rays.
#[inline(always)]
pub fn safe_inverse(direction: Vec3) -> Vec3 {
    // Sign taken from the sign bit so that -0.0 maps to the negative side.
    Vec3::ONE.copysign(direction) / direction.abs().max(Vec3::splat(1e-15))
}

/// Ray representation designed for quicker intersection against axis aligned bounding boxes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeRay {
    pub origin: Vec3,
    pub direction: Vec3,
    pub inverse_direction: Vec3,
    pub origin_over_direction: Vec3,
    pub minimum_t: f32,
    pub maximum_t: f32,
}

impl TreeRay {
    #[inline(always)]
    pub fn new(ray: &Ray) -> Self {
        let inverse_direction = safe_inverse(ray.direction);
        Self {
            origin: ray.origin,
            direction: ray.direction,
            inverse_direction,
            origin_over_direction: ray.origin * inverse_direction,
            minimum_t: ray.tnear,
            maximum_t: ray.tfar,
        }
    }
}

/// `K` rays in SoA layout. Bit `i` of `valid` marks lane `i` as active.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayPacket<const K: usize> {
    pub origin_x: [f32; K],
    pub origin_y: [f32; K],
    pub origin_z: [f32; K],
    pub direction_x: [f32; K],
    pub direction_y: [f32; K],
    pub direction_z: [f32; K],
    pub tnear: [f32; K],
    pub tfar: [f32; K],
    pub mask: [u32; K],
    pub id: [u32; K],
    pub valid: u32,
}

impl<const K: usize> Default for RayPacket<K> {
    fn default() -> Self {
        Self {
            origin_x: [0.0; K],
            origin_y: [0.0; K],
            origin_z: [0.0; K],
            direction_x: [0.0; K],
            direction_y: [0.0; K],
            direction_z: [0.0; K],
            tnear: [0.0; K],
            tfar: [0.0; K],
            mask: [0; K],
            id: [0; K],
            valid: 0,
        }
    }
}

impl<const K: usize> RayPacket<K> {
    /// Packs up to `K` rays. Lanes past `rays.len()` and invalid rays stay inactive.
    pub fn from_rays(rays: &[Ray]) -> Self {
        debug_assert!(K <= 32, "Packet lanes are tracked in a 32 bit mask.");
        debug_assert!(rays.len() <= K, "Too many rays for the packet width.");
        let mut packet = Self::default();
        for (i, ray) in rays.iter().enumerate().take(K) {
            packet.set(i, ray);
        }
        packet
    }

    /// Writes `ray` into lane `i` and activates the lane when the ray is valid.
    pub fn set(&mut self, i: usize, ray: &Ray) {
        self.origin_x[i] = ray.origin.x;
        self.origin_y[i] = ray.origin.y;
        self.origin_z[i] = ray.origin.z;
        self.direction_x[i] = ray.direction.x;
        self.direction_y[i] = ray.direction.y;
        self.direction_z[i] = ray.direction.z;
        self.tnear[i] = ray.tnear;
        self.tfar[i] = ray.tfar;
        self.mask[i] = ray.mask;
        self.id[i] = ray.id;
        if ray.is_valid() {
            self.valid |= 1 << i;
        } else {
            self.valid &= !(1 << i);
        }
    }

    #[inline]
    pub fn ray(&self, i: usize) -> Ray {
        Ray {
            origin: Vec3::new(self.origin_x[i], self.origin_y[i], self.origin_z[i]),
            direction: Vec3::new(self.direction_x[i], self.direction_y[i], self.direction_z[i]),
            tnear: self.tnear[i],
            tfar: self.tfar[i],
            mask: self.mask[i],
            id: self.id[i],
        }
    }

    #[inline]
    pub fn is_active(&self, i: usize) -> bool {
        self.valid & (1 << i) != 0
    }

    /// Whether all active rays share one direction octant.
    pub fn is_coherent(&self) -> bool {
        let mut octant = None;
        for i in (0..K).filter(|&i| self.is_active(i)) {
            let o = self.ray(i).octant();
            if *octant.get_or_insert(o) != o {
                return false;
            }
        }
        true
    }
}

/// Iterates the set bits of `mask`, lowest first.
#[inline]
fn lanes(mut mask: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let lane = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(lane)
    })
}

/// Packet traversal state for one packet.
struct PacketState<const K: usize> {
    rays: [Ray; K],
    tree_rays: [TreeRay; K],
    hits: [Hit; K],
    found: u32,
}

impl<const K: usize> PacketState<K> {
    fn new(packet: &RayPacket<K>) -> Self {
        let rays: [Ray; K] = std::array::from_fn(|i| packet.ray(i));
        Self {
            tree_rays: rays.map(|ray| TreeRay::new(&ray)),
            rays,
            hits: [Hit::default(); K],
            found: 0,
        }
    }

    /// Lanes of `mask` whose segment still reaches `distance`.
    #[inline]
    fn reaching(&self, mask: u32, distance: f32) -> u32 {
        lanes(mask)
            .filter(|&lane| distance <= self.rays[lane].tfar)
            .fold(0, |acc, lane| acc | 1 << lane)
    }
}

/// Hybrid switch point for packets of width `K`: a quarter of the lanes, at least one.
pub fn default_switch_threshold(width: usize) -> usize {
    (width / 4).max(1)
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    /// Per child of `node`: the lanes of `active` hitting it and the nearest entry distance.
    fn intersect_children_packet<const K: usize>(
        &self,
        node: NodeRef,
        state: &PacketState<K>,
        active: u32,
    ) -> ([u32; N], [f32; N]) {
        let mut child_masks = [0u32; N];
        let mut child_distances = [f32::INFINITY; N];
        let mut distances = [0.0f32; N];
        for lane in lanes(active) {
            let hit = self.intersect_children(node, &state.tree_rays[lane], &mut distances);
            for child in lanes(hit) {
                child_masks[child] |= 1 << lane;
                child_distances[child] = child_distances[child].min(distances[child]);
            }
        }
        (child_masks, child_distances)
    }

    /// Traces a coherent packet. Once no more than `switch_threshold` lanes remain active in a
    /// subtree, those lanes finish it one ray at a time.
    fn intersect_packet_lanes<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        state: &mut PacketState<K>,
        active: u32,
        switch_threshold: usize,
    ) {
        let mut stack = TraversalStack::new((NodeRef::EMPTY, 0u32, 0.0f32));
        stack.push((self.root, active, f32::NEG_INFINITY));
        while let Some((node, mask, distance)) = stack.pop() {
            let mask = state.reaching(mask, distance);
            if mask == 0 {
                continue;
            }
            if (mask.count_ones() as usize) <= switch_threshold {
                for lane in lanes(mask) {
                    let (ray, hit) = (&mut state.rays[lane], &mut state.hits[lane]);
                    if self.intersect_subtree(node, scene, ray, hit) {
                        state.found |= 1 << lane;
                        state.tree_rays[lane].maximum_t = ray.tfar;
                    }
                }
                continue;
            }
            match node.kind {
                NodeKind::Leaf { block, count } => {
                    for lane in lanes(mask) {
                        let (ray, hit) = (&mut state.rays[lane], &mut state.hits[lane]);
                        if self.intersect_leaf(block, count, ray, hit, scene) {
                            state.found |= 1 << lane;
                            state.tree_rays[lane].maximum_t = ray.tfar;
                        }
                    }
                }
                NodeKind::Empty | NodeKind::Invalid => {}
                _ => {
                    let (child_masks, child_distances) = self.intersect_children_packet(node, state, mask);
                    let any = child_masks
                        .iter()
                        .enumerate()
                        .fold(0u32, |acc, (i, &m)| if m != 0 { acc | 1 << i } else { acc });
                    let mut order = [(0.0f32, 0usize); N];
                    let count = sort_hit_children(any, &child_distances, &mut order);
                    let children = self.children(node);
                    for &(distance, i) in order[..count].iter().rev() {
                        stack.push((children[i], child_masks[i], distance));
                    }
                }
            }
        }
    }

    fn occluded_packet_lanes<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        state: &PacketState<K>,
        active: u32,
        switch_threshold: usize,
    ) -> u32 {
        let mut occluded = 0u32;
        let mut stack = TraversalStack::new((NodeRef::EMPTY, 0u32));
        stack.push((self.root, active));
        while let Some((node, mask)) = stack.pop() {
            let mask = mask & !occluded;
            if mask == 0 {
                continue;
            }
            if (mask.count_ones() as usize) <= switch_threshold {
                for lane in lanes(mask) {
                    if self.occluded_subtree(node, scene, &state.rays[lane]) {
                        occluded |= 1 << lane;
                    }
                }
                continue;
            }
            match node.kind {
                NodeKind::Leaf { block, count } => {
                    for lane in lanes(mask) {
                        if self.occluded_leaf(block, count, &state.rays[lane], scene) {
                            occluded |= 1 << lane;
                        }
                    }
                }
                NodeKind::Empty | NodeKind::Invalid => {}
                _ => {
                    let (child_masks, _) = self.intersect_children_packet(node, state, mask);
                    let children = self.children(node);
                    for i in (0..N).rev() {
                        if child_masks[i] != 0 {
                            stack.push((children[i], child_masks[i]));
                        }
                    }
                }
            }
            if occluded == active {
                break;
            }
        }
        occluded
    }

    /// Nearest hits of all active lanes of `packet`. Lane `tfar` values shrink to the hit
    /// distances. Incoherent packets are traced ray by ray.
    pub fn intersect_packet<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        packet: &mut RayPacket<K>,
        switch_threshold: usize,
    ) -> [Option<Hit>; K] {
        let mut results = [None; K];
        if self.is_empty() || packet.valid == 0 {
            return results;
        }
        if !packet.is_coherent() {
            for lane in lanes(packet.valid) {
                let mut ray = packet.ray(lane);
                results[lane] = self.intersect(scene, &mut ray);
                packet.tfar[lane] = ray.tfar;
            }
            return results;
        }
        let mut state = PacketState::new(packet);
        self.intersect_packet_lanes(scene, &mut state, packet.valid, switch_threshold);
        for lane in lanes(state.found) {
            results[lane] = Some(state.hits[lane]);
            packet.tfar[lane] = state.rays[lane].tfar;
        }
        results
    }

    /// Occlusion of all active lanes of `packet`.
    pub fn occluded_packet<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        packet: &RayPacket<K>,
        switch_threshold: usize,
    ) -> [bool; K] {
        let mut results = [false; K];
        if self.is_empty() || packet.valid == 0 {
            return results;
        }
        if !packet.is_coherent() {
            for lane in lanes(packet.valid) {
                results[lane] = self.occluded(scene, &packet.ray(lane));
            }
            return results;
        }
        let state = PacketState::new(packet);
        let occluded = self.occluded_packet_lanes(scene, &state, packet.valid, switch_threshold);
        for lane in lanes(occluded) {
            results[lane] = true;
        }
        results
    }

    /// Traces a stream of rays in octant-coherent packets of `K`. `hits[i]` receives the result
    /// of `rays[i]`, whose `tfar` shrinks to the hit distance.
    pub fn intersect_stream<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        rays: &mut [Ray],
        hits: &mut [Option<Hit>],
        switch_threshold: usize,
    ) {
        debug_assert_eq!(rays.len(), hits.len(), "Every ray needs a result slot.");
        for group in group_by_octant(rays) {
            for chunk in group.chunks(K) {
                let batch: Vec<Ray> = chunk.iter().map(|&i| rays[i]).collect();
                let mut packet = RayPacket::<K>::from_rays(&batch);
                let results = self.intersect_packet(scene, &mut packet, switch_threshold);
                for (lane, &i) in chunk.iter().enumerate() {
                    hits[i] = results[lane];
                    rays[i].tfar = packet.tfar[lane];
                }
            }
        }
    }

    /// Occlusion of a stream of rays, traced in octant-coherent packets of `K`.
    pub fn occluded_stream<const K: usize>(
        &self,
        scene: &dyn GeometryProvider,
        rays: &[Ray],
        occluded: &mut [bool],
        switch_threshold: usize,
    ) {
        debug_assert_eq!(rays.len(), occluded.len(), "Every ray needs a result slot.");
        for group in group_by_octant(rays) {
            for chunk in group.chunks(K) {
                let batch: Vec<Ray> = chunk.iter().map(|&i| rays[i]).collect();
                let packet = RayPacket::<K>::from_rays(&batch);
                let results = self.occluded_packet(scene, &packet, switch_threshold);
                for (lane, &i) in chunk.iter().enumerate() {
                    occluded[i] = results[lane];
                }
            }
        }
    }
}

/// Ray indices bucketed by direction octant, in input order within each bucket.
fn group_by_octant(rays: &[Ray]) -> [Vec<usize>; 8] {
    let mut groups: [Vec<usize>; 8] = Default::default();
    for (i, ray) in rays.iter().enumerate() {
        groups[ray.octant()].push(i);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildSettings, NodeEncoding};
    use crate::primitives::Triangle4;
    use crate::test_support::{random_rays, random_scene};

    #[test]
    fn test_safe_inverse_stays_finite() {
        let inverse = safe_inverse(Vec3::new(0.0, -0.0, 2.0));
        assert!(inverse.is_finite());
        assert!(inverse.x > 1e14 && inverse.y < -1e14);
        assert_eq!(inverse.z, 0.5);
        let negative = safe_inverse(Vec3::new(-0.0, -1.0e-20, -4.0));
        assert!(negative.x < -1e14 && negative.y < -1e14);
        assert_eq!(negative.z, -0.25);
    }

    #[test]
    fn test_packet_lanes_round_trip() {
        let rays = random_rays(5, 10.0, 3);
        let mut invalid = rays[4];
        invalid.direction = Vec3::ZERO;
        let mut packet = RayPacket::<8>::from_rays(&rays[..4]);
        packet.set(4, &invalid);
        assert_eq!(packet.valid, 0b1111);
        assert_eq!(packet.ray(2), rays[2]);
        assert_eq!(lanes(0b10110).collect::<Vec<_>>(), vec![1, 2, 4]);
    }

    #[test]
    fn test_coherence_by_octant() {
        let a = Ray::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        let b = Ray::new(Vec3::ONE, Vec3::new(0.5, 2.0, 0.1));
        let c = Ray::new(Vec3::ONE, Vec3::new(-0.5, 2.0, 0.1));
        assert!(RayPacket::<4>::from_rays(&[a, b]).is_coherent());
        assert!(!RayPacket::<4>::from_rays(&[a, b, c]).is_coherent());
    }

    #[test]
    fn test_packet_and_stream_match_single_rays() {
        let scene = random_scene(800, 21);
        for encoding in [NodeEncoding::Aligned, NodeEncoding::Quantized, NodeEncoding::Unaligned] {
            let settings = BuildSettings::default().with_encoding(encoding);
            let bvh = Bvh::<Triangle4, 4>::build(&scene, &settings).unwrap();
            let rays = random_rays(300, 50.0, 9);

            let expected: Vec<Option<Hit>> = rays
                .iter()
                .map(|ray| bvh.intersect(&scene, &mut ray.clone()))
                .collect();
            let expected_occluded: Vec<bool> = rays.iter().map(|ray| bvh.occluded(&scene, ray)).collect();

            for threshold in [0, 2, 16] {
                let mut stream = rays.clone();
                let mut hits = vec![None; rays.len()];
                bvh.intersect_stream::<16>(&scene, &mut stream, &mut hits, threshold);
                assert_eq!(hits, expected);
                for (ray, hit) in stream.iter().zip(&hits) {
                    assert_eq!(ray.tfar, hit.map_or(f32::INFINITY, |h| h.t));
                }

                let mut occluded = vec![false; rays.len()];
                bvh.occluded_stream::<8>(&scene, &rays, &mut occluded, threshold);
                assert_eq!(occluded, expected_occluded);
            }
        }
    }

    #[test]
    fn test_incoherent_packet_falls_back_to_single_rays() {
        let scene = random_scene(200, 4);
        let bvh = Bvh::<Triangle4, 8>::build(&scene, &BuildSettings::default()).unwrap();
        let rays = random_rays(8, 50.0, 17);
        let mut packet = RayPacket::<8>::from_rays(&rays);
        let hits = bvh.intersect_packet(&scene, &mut packet, default_switch_threshold(8));
        for (lane, ray) in rays.iter().enumerate() {
            assert_eq!(hits[lane], bvh.intersect(&scene, &mut ray.clone()));
        }
    }
}
