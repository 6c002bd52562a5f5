use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};

use treegrav::{direct, DomainLimits, GravityTree, ParticleSet, ParticleTag, SplitKind, TreeConfig};

fn gen_cloud(seed: u64, n: usize, dim: usize) -> ParticleSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pc = ParticleSet::with_capacity(n);
    for _ in 0..n {
        let mut x = [0.0; 3];
        for k in x.iter_mut().take(dim) {
            *k = rng.gen::<f64>() * 0.98 + 0.01;
        }
        pc.push(x, 0.5 + rng.gen::<f64>(), ParticleTag::Real);
    }
    pc
}

fn serial_config(dim: usize, theta: f64) -> TreeConfig {
    TreeConfig {
        dim,
        domain: DomainLimits::unit(),
        opening_angle: theta,
        ..TreeConfig::default()
    }
}

#[test]
fn single_particle_feels_nothing() {
    let mut pc = ParticleSet::new();
    pc.push([0.5, 0.5, 0.5], 1.0, ParticleTag::Real);

    let mut tree = GravityTree::new(serial_config(3, 0.5)).unwrap();
    tree.build(&pc).unwrap();
    // the root itself holds the particle
    assert!(tree.node(0).flags.is_leaf());
    assert!(tree.node(0).flags.has_particle());

    tree.walk(&mut pc).unwrap();
    assert_eq!(pc.accel[0], [0.0, 0.0, 0.0]);
}

#[test]
fn two_particles_opposite_corners() {
    let mut pc = ParticleSet::new();
    pc.push([0.25, 0.25, 0.25], 1.0, ParticleTag::Real);
    pc.push([0.75, 0.75, 0.75], 1.0, ParticleTag::Real);

    let mut tree = GravityTree::new(serial_config(3, 0.5)).unwrap();
    tree.build(&pc).unwrap();
    assert!(!tree.node(0).flags.is_leaf());
    // one subdivision: root + 8 children
    assert_eq!(tree.pool().count_nodes(), 9);

    tree.walk(&mut pc).unwrap();
    let a0 = pc.accel[0];
    let a1 = pc.accel[1];

    // equal magnitude, opposite direction, along the cube diagonal
    let mag = |a: [f64; 3]| (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt();
    assert_relative_eq!(mag(a0), 4.0 / 3.0, max_relative = 1e-12);
    assert_relative_eq!(mag(a1), 4.0 / 3.0, max_relative = 1e-12);
    for k in 0..3 {
        assert_relative_eq!(a0[k], (4.0 / 3.0) / 3f64.sqrt(), max_relative = 1e-12);
        assert_relative_eq!(a0[k], -a1[k], max_relative = 1e-12);
    }
}

#[test]
fn four_planar_particles_pull_inward() {
    let corners = [[0.25, 0.25], [0.75, 0.25], [0.25, 0.75], [0.75, 0.75]];
    let mut pc = ParticleSet::new();
    for c in corners {
        pc.push([c[0], c[1], 0.0], 1.0, ParticleTag::Real);
    }

    let mut tree = GravityTree::new(serial_config(2, 1e-3)).unwrap();
    tree.build(&pc).unwrap();
    tree.walk(&mut pc).unwrap();

    let mags: Vec<f64> = pc
        .accel
        .iter()
        .map(|a| (a[0] * a[0] + a[1] * a[1]).sqrt())
        .collect();
    for m in &mags[1..] {
        assert_relative_eq!(*m, mags[0], max_relative = 1e-12);
    }
    // every acceleration points at the square's center
    for i in 0..4 {
        let to_center = [0.5 - corners[i][0], 0.5 - corners[i][1]];
        let a = pc.accel[i];
        let dot = a[0] * to_center[0] + a[1] * to_center[1];
        let cross = a[0] * to_center[1] - a[1] * to_center[0];
        assert!(dot > 0.0);
        assert_relative_eq!(cross, 0.0, epsilon = 1e-12);
        assert_eq!(a[2], 0.0);
    }
}

#[test]
fn full_opening_matches_direct_summation() {
    let pc_template = gen_cloud(1, 256, 3);
    let mut pc = pc_template.clone();

    // a tiny opening angle forces the walk down to the leaves
    let mut tree = GravityTree::new(serial_config(3, 1e-6)).unwrap();
    tree.build(&pc).unwrap();
    tree.walk(&mut pc).unwrap();

    let reference = direct::direct_accelerations(3, &pc_template.position, &pc_template.mass);
    for i in 0..pc.len() {
        for k in 0..3 {
            assert_relative_eq!(pc.accel[i][k], reference[i][k], max_relative = 1e-10, epsilon = 1e-10);
        }
    }
}

#[test]
fn moderate_theta_stays_close_to_direct() {
    let pc_template = gen_cloud(2, 512, 3);
    let mut pc = pc_template.clone();

    let mut tree = GravityTree::new(serial_config(3, 0.5)).unwrap();
    tree.build(&pc).unwrap();
    tree.walk(&mut pc).unwrap();

    let reference = direct::direct_accelerations(3, &pc_template.position, &pc_template.mass);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..pc.len() {
        for k in 0..3 {
            let d = pc.accel[i][k] - reference[i][k];
            num += d * d;
            den += reference[i][k] * reference[i][k];
        }
    }
    let rel_rms = (num / den).sqrt();
    assert!(rel_rms < 0.02, "rms error {rel_rms} too large for theta = 0.5");
}

#[test]
fn acceleration_criterion_tightens_with_tolerance() {
    let pc_template = gen_cloud(3, 400, 3);
    let reference = direct::direct_accelerations(3, &pc_template.position, &pc_template.mass);

    let mut errs = Vec::new();
    for tol in [1e-1, 1e-3, 1e-5] {
        let mut pc = pc_template.clone();
        let cfg = TreeConfig {
            split: SplitKind::Acceleration,
            accel_tol: tol,
            ..serial_config(3, 0.5)
        };
        let mut tree = GravityTree::new(cfg).unwrap();
        tree.build(&pc).unwrap();
        tree.walk(&mut pc).unwrap();

        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..pc.len() {
            for k in 0..3 {
                let d = pc.accel[i][k] - reference[i][k];
                num += d * d;
                den += reference[i][k] * reference[i][k];
            }
        }
        errs.push((num / den).sqrt());
    }
    assert!(errs[2] <= errs[0], "error did not shrink with tolerance: {errs:?}");
    assert!(errs[2] < 1e-4, "tight tolerance still inaccurate: {}", errs[2]);
}

#[test]
fn ghosts_are_invisible_to_the_walk() {
    let mut with_ghosts = gen_cloud(4, 128, 3);
    let plain = with_ghosts.clone();
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..32 {
        let x = [rng.gen(), rng.gen(), rng.gen()];
        with_ghosts.push(x, 10.0, ParticleTag::Ghost);
    }

    let mut tree_a = GravityTree::new(serial_config(3, 0.5)).unwrap();
    tree_a.build(&with_ghosts).unwrap();
    tree_a.walk(&mut with_ghosts).unwrap();

    let mut plain_out = plain.clone();
    let mut tree_b = GravityTree::new(serial_config(3, 0.5)).unwrap();
    tree_b.build(&plain_out).unwrap();
    tree_b.walk(&mut plain_out).unwrap();

    for i in 0..plain.len() {
        assert_eq!(with_ghosts.accel[i], plain_out.accel[i]);
    }
}

#[test]
fn at_point_queries_match_direct() {
    let pc = gen_cloud(6, 300, 3);
    let mut tree = GravityTree::new(serial_config(3, 1e-6)).unwrap();
    tree.build(&pc).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let points: Vec<[f64; 3]> = (0..50)
        .map(|_| [rng.gen::<f64>() * 2.0, rng.gen::<f64>() * 2.0, rng.gen::<f64>() * 2.0])
        .collect();

    let mut out = vec![[0.0; 3]; points.len()];
    tree.accelerations_at_points(&points, &mut out);
    let reference =
        direct::direct_accelerations_at_points(3, &pc.position, &pc.mass, &points);
    for i in 0..points.len() {
        for k in 0..3 {
            assert_relative_eq!(out[i][k], reference[i][k], max_relative = 1e-10, epsilon = 1e-10);
        }
    }
}
