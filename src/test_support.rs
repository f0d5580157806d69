//! Scene and ray generators shared by the unit tests.

use crate::ray::{Hit, Ray};
use crate::scene::{Scene, TriangleMesh, UserGeometry};
use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Unit spheres centered at `(2 * i, 0, 0)`.
pub fn sphere_row(count: usize) -> UserGeometry {
    let center = |i: u32| Vec3::new(2.0 * i as f32, 0.0, 0.0);
    UserGeometry::new(
        count,
        move |i| Some(BoundingBox::new(center(i) - 1.0, center(i) + 1.0)),
        move |i, ray| {
            let oc = ray.origin - center(i);
            let a = ray.direction.length_squared();
            let b = oc.dot(ray.direction);
            let c = oc.length_squared() - 1.0;
            let disc = b * b - a * c;
            if disc < 0.0 {
                return None;
            }
            let t = (-b - disc.sqrt()) / a;
            (t >= ray.tnear && t <= ray.tfar).then(|| Hit {
                t,
                ng: ray.at(t) - center(i),
                ..Default::default()
            })
        },
    )
}

fn random_vec(rng: &mut StdRng, scale: f32) -> Vec3 {
    Vec3::new(rng.gen(), rng.gen(), rng.gen()) * scale
}

/// `count` small random triangles scattered in a cube of side `extent`.
pub fn random_triangles(count: usize, extent: f32, seed: u64) -> TriangleMesh {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vertices = Vec::with_capacity(count * 3);
    let mut indices = Vec::with_capacity(count);
    for i in 0..count as u32 {
        let base = random_vec(&mut rng, extent);
        vertices.push(base);
        vertices.push(base + random_vec(&mut rng, 2.0) - 1.0);
        vertices.push(base + random_vec(&mut rng, 2.0) - 1.0);
        indices.push([3 * i, 3 * i + 1, 3 * i + 2]);
    }
    TriangleMesh::new(vertices, indices)
}

/// Scene holding one random triangle mesh.
pub fn random_scene(count: usize, seed: u64) -> Scene {
    let mut scene = Scene::new();
    scene.add_triangle_mesh(random_triangles(count, 50.0, seed));
    scene
}

/// Rays starting outside the `[0, extent]^3` cube aimed at random points inside it.
pub fn random_rays(count: usize, extent: f32, seed: u64) -> Vec<Ray> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count as u32)
        .map(|id| {
            let target = random_vec(&mut rng, extent);
            let offset = (random_vec(&mut rng, 2.0) - 1.0).normalize_or(Vec3::X);
            let origin = Vec3::splat(extent * 0.5) + offset * extent * 2.0;
            Ray::new(origin, target - origin).with_id(id)
        })
        .collect()
}
