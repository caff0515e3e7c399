use criterion::{black_box, criterion_group, criterion_main, Criterion};
use forged_navigation::{build_nav_mesh, BuildContext, NavMeshConfig};
use glam::{uvec3, UVec3, Vec3};

fn push_floor(
    vertices: &mut Vec<Vec3>,
    triangles: &mut Vec<UVec3>,
    x0: f32,
    z0: f32,
    x1: f32,
    z1: f32,
    y: f32,
) {
    let base = vertices.len() as u32;
    vertices.extend_from_slice(&[
        Vec3::new(x0, y, z0),
        Vec3::new(x1, y, z0),
        Vec3::new(x1, y, z1),
        Vec3::new(x0, y, z1),
    ]);
    triangles.push(uvec3(base, base + 2, base + 1));
    triangles.push(uvec3(base, base + 3, base + 2));
}

fn config() -> NavMeshConfig {
    NavMeshConfig::from_agent(
        0.5,
        1.9,
        0.4,
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(25.0, 5.0, 25.0),
    )
}

fn generate_single_plane() {
    let mut vertices = Vec::new();
    let mut triangles = Vec::new();
    push_floor(&mut vertices, &mut triangles, 0.0, 0.0, 25.0, 25.0, 0.0);

    let mut ctx = BuildContext::new();
    black_box(build_nav_mesh(&mut ctx, &config(), &vertices, &triangles, None).unwrap());
}

fn generate_plane_with_platforms() {
    let mut vertices = Vec::new();
    let mut triangles = Vec::new();
    push_floor(&mut vertices, &mut triangles, 0.0, 0.0, 25.0, 25.0, 0.0);
    push_floor(&mut vertices, &mut triangles, 2.0, 2.0, 10.0, 10.0, 2.5);
    push_floor(&mut vertices, &mut triangles, 14.0, 6.0, 22.0, 18.0, 2.1);
    push_floor(&mut vertices, &mut triangles, 5.0, 15.0, 11.0, 23.0, 2.8);

    let mut ctx = BuildContext::new();
    black_box(build_nav_mesh(&mut ctx, &config(), &vertices, &triangles, None).unwrap());
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("single plane", |b| b.iter(generate_single_plane));
    c.bench_function("plane with platforms", |b| {
        b.iter(generate_plane_with_platforms)
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
