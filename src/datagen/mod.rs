//! Synthetic datasets and format conversions for tests and benchmarks.
//!
//! Every generator is seeded. Conversions return a `(reference, converted)`
//! pair so that a test can compare what a consumer produced from the
//! converted value against the plain reference array.

pub mod sparse;

pub use sparse::{sparsify_and_convert, CscMatrix, CsrMatrix, SparseFormat, SparseMatrix};

use crate::core::error::{KnnError, Result};

use ndarray::{Array1, Array2, ArrayView2, ShapeBuilder, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Default relative tolerance of [`allclose`]
pub const DEFAULT_RTOL: f64 = 1e-5;

/// Default absolute tolerance of [`allclose`]
pub const DEFAULT_ATOL: f64 = 1e-5;

/// Shape of a synthetic classification problem.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct ClassificationSpec {
    pub n_samples: usize,
    pub n_features: usize,
    /// Features that carry class information; the rest are noise
    pub n_informative: usize,
    pub n_classes: usize,
    pub n_clusters_per_class: usize,
    /// Half the edge length of the hypercube the cluster centers sit on
    pub class_sep: f64,
    pub seed: u64,
}

impl Default for ClassificationSpec {
    fn default() -> Self {
        ClassificationSpec {
            n_samples: 500,
            n_features: 20,
            n_informative: 12,
            n_classes: 5,
            n_clusters_per_class: 1,
            class_sep: 1.0,
            seed: 0,
        }
    }
}

impl ClassificationSpec {
    fn validate(&self) -> Result<()> {
        if self.n_samples == 0
            || self.n_features == 0
            || self.n_classes == 0
            || self.n_clusters_per_class == 0
        {
            return Err(KnnError::config("classification problem dimensions must be positive"));
        }
        if self.n_informative == 0 || self.n_informative > self.n_features {
            return Err(KnnError::invalid_parameter(
                "n_informative",
                self.n_informative.to_string(),
                format!("must lie in 1..={}", self.n_features),
            ));
        }
        let clusters = self.n_classes * self.n_clusters_per_class;
        if self.n_informative < usize::BITS as usize && clusters > 1usize << self.n_informative {
            return Err(KnnError::invalid_parameter(
                "n_classes",
                self.n_classes.to_string(),
                format!(
                    "{} clusters do not fit on the vertices of a {}-dimensional hypercube",
                    clusters, self.n_informative
                ),
            ));
        }
        Ok(())
    }
}

/// Gaussian clusters centered on hypercube vertices.
///
/// Returns column-major features and the class of every row. Samples are
/// spread evenly over the clusters and then shuffled.
pub fn make_classification(spec: &ClassificationSpec) -> Result<(Array2<f64>, Array1<i64>)> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let n_clusters = spec.n_classes * spec.n_clusters_per_class;

    let mut order: Vec<usize> = (0..spec.n_samples).collect();
    order.shuffle(&mut rng);

    let mut features = Array2::<f64>::zeros((spec.n_samples, spec.n_features).f());
    let mut labels = Array1::<i64>::zeros(spec.n_samples);
    for (sample, &row) in order.iter().enumerate() {
        let cluster = sample % n_clusters;
        labels[row] = (cluster % spec.n_classes) as i64;
        for feature in 0..spec.n_features {
            let noise: f64 = rng.sample(StandardNormal);
            features[[row, feature]] = if feature < spec.n_informative {
                let bit = feature < 64 && (cluster >> feature) & 1 == 1;
                noise + if bit { spec.class_sep } else { -spec.class_sep }
            } else {
                noise
            };
        }
    }

    log::debug!(
        "Generated {} samples, {} features, {} classes",
        spec.n_samples,
        spec.n_features,
        spec.n_classes
    );
    Ok((features, labels))
}

/// Column-major `f64` array of integers drawn uniformly from `[0, high)`.
pub fn random_integers(rows: usize, cols: usize, high: u32, seed: u64) -> Result<Array2<f64>> {
    if high == 0 {
        return Err(KnnError::invalid_parameter("high", "0", "must be positive"));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Array2::<f64>::zeros((rows, cols).f());
    out.mapv_inplace(|_| f64::from(rng.gen_range(0..high)));
    Ok(out)
}

/// In-memory representations a dense dataset can be converted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseFormat {
    /// C-order array
    RowMajor,
    /// Fortran-order array
    ColumnMajor,
    /// Columnar data frame with one `f64` column per feature
    #[cfg(feature = "polars")]
    Frame,
}

/// A dataset after [`convert`].
#[derive(Debug, Clone)]
pub enum Converted {
    /// Row- or column-major array
    Dense(Array2<f64>),
    /// Data frame
    #[cfg(feature = "polars")]
    Frame(polars::prelude::DataFrame),
}

impl Converted {
    /// Bring the value back to a dense array for comparison
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        match self {
            Converted::Dense(array) => Ok(array.clone()),
            #[cfg(feature = "polars")]
            Converted::Frame(frame) => frame_to_array(frame),
        }
    }
}

/// Convert `dataset` to `format`; returns `(reference, converted)`.
pub fn convert(dataset: &Array2<f64>, format: DenseFormat) -> Result<(Array2<f64>, Converted)> {
    let converted = match format {
        DenseFormat::RowMajor => Converted::Dense(dataset.as_standard_layout().into_owned()),
        DenseFormat::ColumnMajor => {
            let mut fortran = Array2::zeros(dataset.raw_dim().f());
            fortran.assign(dataset);
            Converted::Dense(fortran)
        }
        #[cfg(feature = "polars")]
        DenseFormat::Frame => Converted::Frame(array_to_frame(dataset)?),
    };
    Ok((dataset.clone(), converted))
}

#[cfg(feature = "polars")]
fn array_to_frame(dataset: &Array2<f64>) -> Result<polars::prelude::DataFrame> {
    use polars::prelude::*;

    let columns: Vec<Column> = dataset
        .columns()
        .into_iter()
        .enumerate()
        .map(|(j, values)| Series::new(format!("f{}", j).into(), values.to_vec()).into())
        .collect();
    DataFrame::new(columns)
        .map_err(|e| KnnError::dataset(format!("cannot build data frame: {}", e)))
}

#[cfg(feature = "polars")]
fn frame_to_array(frame: &polars::prelude::DataFrame) -> Result<Array2<f64>> {
    let mut out = Array2::zeros((frame.height(), frame.width()).f());
    for (j, column) in frame.get_columns().iter().enumerate() {
        let values = column
            .as_materialized_series()
            .f64()
            .map_err(|e| KnnError::dataset(format!("column {} is not f64: {}", j, e)))?;
        for (i, value) in values.into_iter().enumerate() {
            out[[i, j]] = value.unwrap_or(f64::NAN);
        }
    }
    Ok(out)
}

/// Elementwise `|actual - desired| <= atol + rtol * |desired|`; NaNs in the
/// same position compare equal. Arrays of different shapes are never close.
pub fn allclose(
    actual: ArrayView2<'_, f64>,
    desired: ArrayView2<'_, f64>,
    rtol: f64,
    atol: f64,
) -> bool {
    if actual.shape() != desired.shape() {
        return false;
    }
    Zip::from(&actual).and(&desired).all(|&a, &d| {
        (a.is_nan() && d.is_nan()) || (a - d).abs() <= atol + rtol * d.abs()
    })
}

/// Panic with the first offending position unless [`allclose`] holds.
pub fn assert_allclose(
    actual: ArrayView2<'_, f64>,
    desired: ArrayView2<'_, f64>,
    rtol: f64,
    atol: f64,
) {
    if actual.shape() != desired.shape() {
        panic!("shape mismatch: {:?} vs {:?}", actual.shape(), desired.shape());
    }
    if let Some(((i, j), a)) = actual.indexed_iter().find(|&((i, j), &a)| {
        let d = desired[[i, j]];
        !((a.is_nan() && d.is_nan()) || (a - d).abs() <= atol + rtol * d.abs())
    }) {
        panic!(
            "not close at ({}, {}): actual {} desired {} (rtol {}, atol {})",
            i,
            j,
            a,
            desired[[i, j]],
            rtol,
            atol
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_make_classification_shape_and_classes() {
        let (x, y) = make_classification(&ClassificationSpec::default()).unwrap();
        assert_eq!(x.dim(), (500, 20));
        assert!(x.t().is_standard_layout());
        let classes: BTreeSet<i64> = y.iter().copied().collect();
        assert_eq!(classes, (0..5).collect());

        let again = make_classification(&ClassificationSpec::default()).unwrap();
        assert_eq!(x, again.0);
    }

    #[test]
    fn test_make_classification_rejects_crowded_hypercube() {
        let spec = ClassificationSpec {
            n_informative: 2,
            n_classes: 5,
            ..ClassificationSpec::default()
        };
        assert!(make_classification(&spec).is_err());
    }

    #[test]
    fn test_random_integers_range() {
        let x = random_integers(500, 20, 30, 3).unwrap();
        assert!(x.iter().all(|&v| (0.0..30.0).contains(&v) && v.fract() == 0.0));
        assert!(x.t().is_standard_layout());
    }

    #[test]
    fn test_convert_preserves_values() {
        let x = random_integers(8, 3, 30, 1).unwrap();
        for format in [DenseFormat::RowMajor, DenseFormat::ColumnMajor] {
            let (reference, converted) = convert(&x, format).unwrap();
            assert_allclose(
                converted.to_dense().unwrap().view(),
                reference.view(),
                DEFAULT_RTOL,
                DEFAULT_ATOL,
            );
        }
    }

    #[test]
    fn test_allclose_semantics() {
        let a = Array2::from_elem((2, 2), 1.0);
        let mut b = a.clone();
        b[[0, 1]] = 1.0 + 1.5e-5;
        assert!(allclose(a.view(), b.view(), DEFAULT_RTOL, DEFAULT_ATOL));
        b[[0, 1]] = 1.1;
        assert!(!allclose(a.view(), b.view(), DEFAULT_RTOL, DEFAULT_ATOL));
        assert!(!allclose(a.view(), Array2::zeros((1, 2)).view(), DEFAULT_RTOL, DEFAULT_ATOL));
    }
}
