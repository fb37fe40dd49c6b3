use approx::assert_abs_diff_eq;
use natgrad::{DiagRep, Kron, SymMatrix, UnitWise};
use ndarray::{Array1, Array2, Array3, array};
use std::path::Path;

fn assert_close_f32(a: &Array2<f64>, b: &Array2<f64>) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        // Storage is 32-bit by contract, so compare at f32 resolution.
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6 * (1.0 + x.abs()));
    }
}

#[test]
fn save_and_load_round_trips_every_representation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let root = dir.path();

    let full = array![[2.0, 0.5], [0.5, 3.0]];
    let kron_a = array![[1.5, 0.25, 0.0], [0.25, 2.0, 0.1], [0.0, 0.1, 1.0]];
    let kron_b = array![[1.0, 0.3], [0.3, 2.5]];
    let diag_w = array![[0.1, 0.2], [0.3, 0.4]];
    let diag_b = array![7.0, 8.0];
    let unit = Array3::from_shape_vec(
        (2, 2, 2),
        vec![1.0, 0.2, 0.2, 1.0, 3.0, -0.1, -0.1, 2.0],
    )
    .expect("shape matches data");

    let mut matrix = SymMatrix::from_full(full.clone()).expect("square");
    matrix
        .accumulate(&SymMatrix::from_kron(
            Kron::new(kron_a.clone(), kron_b.clone()).expect("square factors"),
        ))
        .expect("disjoint representations");
    matrix
        .accumulate(&SymMatrix::from_diag(DiagRep::new(
            Some(diag_w.clone()),
            Some(diag_b.clone()),
        )))
        .expect("disjoint representations");
    matrix
        .accumulate(&SymMatrix::from_unit(
            UnitWise::new(unit.clone()).expect("square blocks"),
        ))
        .expect("disjoint representations");

    let paths = matrix
        .save(root, Path::new("layer0"))
        .expect("save all representations");
    assert!(root.join("layer0/tril.npy").is_file());
    assert!(root.join("layer0/kron/A_tril.npy").is_file());
    assert!(root.join("layer0/kron/B_tril.npy").is_file());
    assert!(root.join("layer0/diag/weight.npy").is_file());
    assert!(root.join("layer0/diag/bias.npy").is_file());
    assert!(root.join("layer0/unit_wise.npy").is_file());

    // The path index survives serde, as a directory manifest would use it.
    let manifest = serde_json::to_string(&paths).expect("serialize manifest");
    let paths: natgrad::SavedPaths = serde_json::from_str(&manifest).expect("parse manifest");

    let loaded = SymMatrix::load(&paths, root).expect("load all representations");
    assert_close_f32(loaded.full().expect("full"), &full);
    let kron = loaded.kron().expect("kron");
    assert_close_f32(kron.A(), &kron_a);
    assert_close_f32(kron.B(), &kron_b);
    let diag = loaded.diag().expect("diag");
    assert_close_f32(diag.weight().expect("weight"), &diag_w);
    for (x, y) in diag.bias().expect("bias").iter().zip(diag_b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
    }
    for (x, y) in loaded.unit().expect("unit").blocks().iter().zip(unit.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }

    // Inverses are never persisted.
    assert!(loaded.inv().is_none());
    assert!(kron.A_inv().is_none());
}

#[test]
fn partial_matrices_save_only_their_populated_parts() {
    let dir = tempfile::tempdir().expect("temp dir");
    let root = dir.path();

    let matrix = SymMatrix::from_kron(
        Kron::new(Array2::<f64>::eye(2), Array2::<f64>::eye(2)).expect("square factors"),
    );
    let paths = matrix.save(root, Path::new("layer1")).expect("save kron");
    assert!(paths.tril.is_none());
    assert!(paths.diag.is_none());
    assert!(paths.unit_wise.is_none());
    assert!(paths.kron.is_some());
    assert!(!root.join("layer1/tril.npy").exists());

    let loaded = SymMatrix::load(&paths, root).expect("load kron");
    assert!(loaded.full().is_none());
    assert!(loaded.kron().is_some());
}

#[test]
fn flat_vector_interface_spans_multiple_matrices() {
    // Two layer matrices sharing one global flat vector, the surface an
    // external eigen-solver works against.
    let m1 = SymMatrix::from_kron(
        Kron::new(array![[2.0, 0.1], [0.1, 1.0]], array![[3.0]]).expect("square factors"),
    );
    let m2 = SymMatrix::from_full(array![[5.0, 1.0], [1.0, 4.0]]).expect("square");

    let v1 = m1.to_vector();
    let v2 = m2.to_vector();
    let mut global = Array1::<f64>::zeros(v1.len() + v2.len());
    global.slice_mut(ndarray::s![..v1.len()]).assign(&v1);
    global.slice_mut(ndarray::s![v1.len()..]).assign(&v2);

    let mut t1 = SymMatrix::from_kron(
        Kron::new(Array2::<f64>::zeros((2, 2)), Array2::<f64>::zeros((1, 1)))
            .expect("square factors"),
    );
    let mut t2 = SymMatrix::from_full(Array2::<f64>::zeros((2, 2))).expect("square");
    let mid = t1.from_vector(&global, 0).expect("first span");
    let end = t2.from_vector(&global, mid).expect("second span");
    assert_eq!(mid, v1.len());
    assert_eq!(end, global.len());
    assert_eq!(t1.kron().expect("kron").A(), m1.kron().expect("kron").A());
    assert_eq!(t2.full().expect("full"), m2.full().expect("full"));
}
