//! Acceleration structure over an owned scene: build, update after edits, and ray queries
//! routed to the configured traverser.

use crate::config::{BuildSettings, TraverserKind};
use crate::error::Result;
use crate::primitives::Primitive;
use crate::ray::{Hit, Ray};
use crate::scene::{GeometryProvider, Scene};
use crate::trees::prim_ref_builder::count_valid_prims;
use crate::trees::ray_batcher::{default_switch_threshold, RayPacket};
use crate::trees::tree::Bvh;
use std::time::Instant;

/// How [`Accel::update`] brought the tree up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// Bounds were recomputed in place.
    Refit,
    /// A new tree was built.
    Rebuild,
}

/// A scene together with an `N`-wide hierarchy over it.
///
/// Edit the scene through [`Accel::scene_mut`], then call [`Accel::update`] before querying.
pub struct Accel<P: Primitive, const N: usize> {
    scene: Scene,
    bvh: Bvh<P, N>,
    settings: BuildSettings,
    /// Reference count of the scene when the current tree was built.
    built_scene_size: usize,
}

impl<P: Primitive, const N: usize> Accel<P, N> {
    /// Wraps `scene` without building anything. Queries miss until [`Accel::build`] succeeds.
    pub fn new(scene: Scene, settings: BuildSettings) -> Self {
        Self {
            scene,
            bvh: Bvh::empty(settings.clone()),
            settings,
            built_scene_size: 0,
        }
    }

    /// Rebuilds the tree with `settings`. On failure the previous tree and settings stay.
    pub fn build(&mut self, settings: BuildSettings) -> Result<()> {
        let hint = (!self.bvh.is_empty()).then(|| self.bvh.bytes_estimate());
        let bvh = Bvh::build_with(&self.scene, &settings, hint, None).inspect_err(|err| {
            log::warn!("accel: rebuild failed, keeping the previous tree: {}", err);
        })?;
        self.bvh = bvh;
        self.settings = settings;
        self.built_scene_size = self.scene.size();
        Ok(())
    }

    /// Brings the tree up to date with the scene. Refits when the scene still has the
    /// primitive count and the valid primitive count it had at build time, otherwise rebuilds.
    ///
    /// Refitting assumes edits only moved geometry. Replace or remove primitives only together
    /// with a change of count, or call [`Accel::build`].
    pub fn update(&mut self) -> Result<UpdateKind> {
        let size = self.scene.size();
        let valid = count_valid_prims(&self.scene);
        let unchanged = size == self.built_scene_size && valid == self.bvh.scene_prim_count();
        if unchanged && !self.bvh.is_empty() {
            let start = Instant::now();
            self.bvh.refit(&self.scene);
            log::debug!("accel: refit in {:.2?}", start.elapsed());
            return Ok(UpdateKind::Refit);
        }
        log::debug!(
            "accel: scene changed from {} primitives ({} valid) to {} ({} valid), rebuilding",
            self.built_scene_size,
            self.bvh.scene_prim_count(),
            size,
            valid
        );
        self.build(self.settings.clone())?;
        Ok(UpdateKind::Rebuild)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// The scene for editing. Queries see the edits only after [`Accel::update`].
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn bvh(&self) -> &Bvh<P, N> {
        &self.bvh
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Active ray count at or below which hybrid traversal continues ray by ray.
    fn switch_threshold(&self, width: usize) -> usize {
        match self.settings.traverser {
            TraverserKind::Packet => 0,
            _ => self
                .settings
                .hybrid_switch_threshold
                .unwrap_or_else(|| default_switch_threshold(width)),
        }
    }

    /// Nearest hit along `ray`. On a hit, `ray.tfar` becomes the hit distance.
    pub fn intersect(&self, ray: &mut Ray) -> Option<Hit> {
        self.bvh.intersect(&self.scene, ray)
    }

    /// Whether anything lies on the segment of `ray`.
    pub fn occluded(&self, ray: &Ray) -> bool {
        self.bvh.occluded(&self.scene, ray)
    }

    pub fn intersect_packet<const K: usize>(&self, packet: &mut RayPacket<K>) -> [Option<Hit>; K] {
        if self.settings.traverser == TraverserKind::Single {
            let mut results = [None; K];
            for lane in 0..K {
                if !packet.is_active(lane) {
                    continue;
                }
                let mut ray = packet.ray(lane);
                results[lane] = self.intersect(&mut ray);
                packet.tfar[lane] = ray.tfar;
            }
            return results;
        }
        self.bvh
            .intersect_packet(&self.scene, packet, self.switch_threshold(K))
    }

    pub fn occluded_packet<const K: usize>(&self, packet: &RayPacket<K>) -> [bool; K] {
        if self.settings.traverser == TraverserKind::Single {
            let mut results = [false; K];
            for lane in (0..K).filter(|&lane| packet.is_active(lane)) {
                results[lane] = self.occluded(&packet.ray(lane));
            }
            return results;
        }
        self.bvh
            .occluded_packet(&self.scene, packet, self.switch_threshold(K))
    }

    /// Nearest hits of a batch of rays, `hits[i]` for `rays[i]`.
    ///
    /// The stream traverser regroups rays by direction octant before packing them. Packet and
    /// hybrid traversers pack them in input order.
    pub fn intersect_stream<const K: usize>(&self, rays: &mut [Ray], hits: &mut [Option<Hit>]) {
        debug_assert_eq!(rays.len(), hits.len(), "Every ray needs a result slot.");
        let threshold = self.switch_threshold(K);
        match self.settings.traverser {
            TraverserKind::Single => {
                for (ray, hit) in rays.iter_mut().zip(hits.iter_mut()) {
                    *hit = self.intersect(ray);
                }
            }
            TraverserKind::Stream => {
                self.bvh
                    .intersect_stream::<K>(&self.scene, rays, hits, threshold)
            }
            TraverserKind::Packet | TraverserKind::Hybrid => {
                for (rays, hits) in rays.chunks_mut(K).zip(hits.chunks_mut(K)) {
                    let mut packet = RayPacket::<K>::from_rays(rays);
                    let results = self.bvh.intersect_packet(&self.scene, &mut packet, threshold);
                    for (lane, (ray, hit)) in rays.iter_mut().zip(hits.iter_mut()).enumerate() {
                        *hit = results[lane];
                        ray.tfar = packet.tfar[lane];
                    }
                }
            }
        }
    }

    /// Occlusion of a batch of rays, `occluded[i]` for `rays[i]`.
    pub fn occluded_stream<const K: usize>(&self, rays: &[Ray], occluded: &mut [bool]) {
        debug_assert_eq!(rays.len(), occluded.len(), "Every ray needs a result slot.");
        let threshold = self.switch_threshold(K);
        match self.settings.traverser {
            TraverserKind::Single => {
                for (ray, result) in rays.iter().zip(occluded.iter_mut()) {
                    *result = self.occluded(ray);
                }
            }
            TraverserKind::Stream => {
                self.bvh
                    .occluded_stream::<K>(&self.scene, rays, occluded, threshold)
            }
            TraverserKind::Packet | TraverserKind::Hybrid => {
                for (rays, occluded) in rays.chunks(K).zip(occluded.chunks_mut(K)) {
                    let packet = RayPacket::<K>::from_rays(rays);
                    let results = self.bvh.occluded_packet(&self.scene, &packet, threshold);
                    occluded.copy_from_slice(&results[..occluded.len()]);
                }
            }
        }
    }
}
