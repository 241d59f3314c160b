//! Test-fixture data generation and conversion.

use distributed_knn::datagen::*;
use distributed_knn::*;

mod common;
use common::*;

#[test]
fn test_classifier_on_converted_layouts() {
    let spec = ClassificationSpec {
        n_samples: 100,
        n_features: 6,
        n_informative: 4,
        n_classes: 3,
        class_sep: 3.0,
        seed: 5,
        ..ClassificationSpec::default()
    };
    let (x, y) = make_classification(&spec).unwrap();

    let cluster = create_cluster(2);
    let client = cluster.client();
    let mut predictions = Vec::new();
    for format in [DenseFormat::RowMajor, DenseFormat::ColumnMajor] {
        let (reference, converted) = convert(&x, format).unwrap();
        let dense = converted.to_dense().unwrap();
        assert_allclose(dense.view(), reference.view(), DEFAULT_RTOL, DEFAULT_ATOL);

        let features = dense.mapv(|v| v as f32);
        let xd = scatter_features(&client, "x", &features, 25);
        let knn = fit_classifier(&client, 5, &xd, &scatter_labels(&client, "y", &y, 25));
        predictions.push(knn.predict(&xd, true).unwrap());
    }
    assert_eq!(predictions[0], predictions[1]);
}

#[test]
fn test_sparse_fixtures_match_reference() {
    let x = random_integers(50, 8, 30, 2).unwrap();
    for format in [SparseFormat::Csr, SparseFormat::Csc] {
        let (reference, converted) = sparsify_and_convert(&x, format, 0.5, 9).unwrap();
        assert_eq!(reference.shape(), (50, 8));
        assert!(reference.nnz() <= 200);
        assert!(allclose(
            converted.to_dense().view(),
            reference.to_dense().view(),
            DEFAULT_RTOL,
            DEFAULT_ATOL
        ));
    }
}

#[cfg(feature = "polars")]
#[test]
fn test_frame_conversion() {
    let x = random_integers(20, 4, 10, 1).unwrap();
    let (reference, converted) = convert(&x, DenseFormat::Frame).unwrap();
    match &converted {
        Converted::Frame(frame) => assert_eq!(frame.shape(), (20, 4)),
        other => panic!("expected a frame, got {:?}", other),
    }
    assert_allclose(
        converted.to_dense().unwrap().view(),
        reference.view(),
        DEFAULT_RTOL,
        DEFAULT_ATOL,
    );
}
