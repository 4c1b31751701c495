use smooth::direct;
use smooth::{KdTree, ParticleStore, Period, SmoothError, NO_WRAP};

fn gen_points(seed: u64, n: usize) -> Vec<[f64; 3]> {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pts = Vec::with_capacity(n);
    for _ in 0..n {
        let x = rng.gen::<f64>() - 0.5;
        let y = rng.gen::<f64>() - 0.5;
        let z = rng.gen::<f64>() - 0.5;
        pts.push([x, y, z]);
    }
    pts
}

fn make_store(pts: &[[f64; 3]]) -> ParticleStore {
    let vel = vec![[0.0f64; 3]; pts.len()];
    let mass = vec![1.0f64; pts.len()];
    ParticleStore::from_arrays(pts, &vel, &mass).unwrap()
}

fn internal_positions(tree: &KdTree) -> Vec<[f64; 3]> {
    tree.store().particles().iter().map(|p| p.r).collect()
}

#[test]
fn build_partitions_particles_exactly() {
    let n = 537;
    let bucket = 8;
    let pts = gen_points(1, n);
    let tree = KdTree::build(make_store(&pts), bucket).unwrap();

    let mut orders = Vec::new();
    for nd in tree.nodes() {
        if nd.is_leaf() {
            assert!(nd.count() >= 1 && nd.count() <= bucket, "leaf size {}", nd.count());
            for p in &tree.store().particles()[nd.first..nd.last] {
                orders.push(p.order);
            }
        }
    }
    orders.sort_unstable();
    let expected: Vec<usize> = (0..n).collect();
    assert_eq!(orders, expected, "leaves must partition the particle set");
}

#[test]
fn child_bounds_contained_in_parent() {
    let pts = gen_points(2, 400);
    let tree = KdTree::build(make_store(&pts), 4).unwrap();
    for nd in tree.nodes() {
        if let Some((lo, hi)) = nd.children {
            assert!(nd.bounds.contains(&tree.nodes()[lo].bounds));
            assert!(nd.bounds.contains(&tree.nodes()[hi].bounds));
            assert_eq!(tree.nodes()[lo].last, tree.nodes()[hi].first);
            assert_eq!(nd.first, tree.nodes()[lo].first);
            assert_eq!(nd.last, tree.nodes()[hi].last);
        }
    }
}

fn check_knn_against_direct(seed: u64, k: usize, period: Period) {
    let pts = gen_points(seed, 256);
    let tree = KdTree::build(make_store(&pts), 6).unwrap();
    let positions = internal_positions(&tree);
    let queries = gen_points(seed + 100, 40);

    let mut idx = Vec::new();
    let mut d2 = Vec::new();
    for q in &queries {
        tree.nearest_neighbors(q, k, &period, &mut idx, &mut d2);
        assert_eq!(idx.len(), k);

        let (mut want_idx, want_d2) = direct::direct_nearest_neighbors(&positions, q, k, &period);
        let mut got_idx = idx.clone();
        got_idx.sort_unstable();
        want_idx.sort_unstable();
        assert_eq!(got_idx, want_idx, "k-NN index set mismatch");

        let mut got_d2 = d2.clone();
        got_d2.sort_by(f64::total_cmp);
        assert_eq!(got_d2, want_d2, "k-NN distance mismatch");
    }
}

#[test]
fn knn_matches_brute_force() {
    check_knn_against_direct(3, 10, NO_WRAP);
    check_knn_against_direct(4, 1, NO_WRAP);
    check_knn_against_direct(5, 33, NO_WRAP);
}

#[test]
fn knn_matches_brute_force_periodic() {
    // Points span [-0.5, 0.5); wrap length 1 on every axis makes
    // opposite faces adjacent.
    check_knn_against_direct(6, 8, [1.0, 1.0, 1.0]);
    // Mixed: only one axis wrapped.
    check_knn_against_direct(7, 8, [1.0, f64::INFINITY, f64::INFINITY]);
}

#[test]
fn ball_gather_matches_brute_force() {
    let pts = gen_points(8, 300);
    let tree = KdTree::build(make_store(&pts), 6).unwrap();
    let positions = internal_positions(&tree);
    let queries = gen_points(9, 20);

    let mut idx = Vec::new();
    let mut d2 = Vec::new();
    for (qi, q) in queries.iter().enumerate() {
        for &r in &[0.01f64, 0.1, 0.3, 1.0] {
            let count = tree.ball_gather(q, r * r, &NO_WRAP, &mut idx, &mut d2);
            assert_eq!(count, idx.len());

            let (mut want_idx, _) = direct::direct_ball_gather(&positions, q, r * r, &NO_WRAP);
            let mut got_idx = idx.clone();
            got_idx.sort_unstable();
            want_idx.sort_unstable();
            assert_eq!(got_idx, want_idx, "ball mismatch at query {qi} radius {r}");
        }
    }
}

#[test]
fn ball_gather_matches_brute_force_periodic() {
    let pts = gen_points(10, 200);
    let tree = KdTree::build(make_store(&pts), 4).unwrap();
    let positions = internal_positions(&tree);
    let period = [1.0, 1.0, 1.0];

    let mut idx = Vec::new();
    let mut d2 = Vec::new();
    for q in &gen_points(11, 20) {
        let r2 = 0.09;
        tree.ball_gather(q, r2, &period, &mut idx, &mut d2);
        let (mut want_idx, _) = direct::direct_ball_gather(&positions, q, r2, &period);
        let mut got_idx = idx.clone();
        got_idx.sort_unstable();
        want_idx.sort_unstable();
        assert_eq!(got_idx, want_idx);
    }
}

#[test]
fn wrapped_axis_distance() {
    // Wrap length 10 along x: 0.5 and 9.5 are one unit apart, not nine.
    let a = [0.5, 0.0, 0.0];
    let b = [9.5, 0.0, 0.0];
    let period = [10.0, f64::INFINITY, f64::INFINITY];
    let d2 = smooth::wrapped_dist2(&a, &b, &period);
    assert!((d2 - 1.0).abs() < 1e-12, "wrapped d2 = {d2}");

    let unwrapped = smooth::wrapped_dist2(&a, &b, &NO_WRAP);
    assert!((unwrapped - 81.0).abs() < 1e-12);
}

#[test]
fn load_rejects_bad_input() {
    let err = ParticleStore::from_arrays(&[], &[], &[]).unwrap_err();
    assert!(matches!(err, SmoothError::EmptyParticleSet));

    let pts = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
    let vel = [[0.0, 0.0, 0.0]];
    let mass = [1.0, 1.0];
    let err = ParticleStore::from_arrays(&pts, &vel, &mass).unwrap_err();
    assert!(matches!(err, SmoothError::LengthMismatch { .. }));

    let pts = [[0.0, 0.0, 0.0], [f64::NAN, 0.0, 0.0]];
    let vel = [[0.0; 3]; 2];
    let err = ParticleStore::from_arrays(&pts, &vel, &mass).unwrap_err();
    assert!(matches!(err, SmoothError::NonFinitePosition { index: 1 }));
}
