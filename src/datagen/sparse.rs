//! Compressed sparse row and column matrices.

use crate::core::error::{KnnError, Result};

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Compressed sparse row matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    /// Compress the non-zero entries of `dense`
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Self {
        let mut indptr = Vec::with_capacity(dense.nrows() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in dense.rows() {
            for (col, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    indices.push(col);
                    data.push(value);
                }
            }
            indptr.push(data.len());
        }
        CsrMatrix {
            nrows: dense.nrows(),
            ncols: dense.ncols(),
            indptr,
            indices,
            data,
        }
    }

    /// Expand to a dense array
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.nrows, self.ncols));
        for row in 0..self.nrows {
            for k in self.indptr[row]..self.indptr[row + 1] {
                dense[[row, self.indices[k]]] = self.data[k];
            }
        }
        dense
    }

    /// Stored entries
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Row pointer array
    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }
}

/// Compressed sparse column matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CscMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CscMatrix {
    /// Compress the non-zero entries of `dense`
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Self {
        let mut indptr = Vec::with_capacity(dense.ncols() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for column in dense.columns() {
            for (row, &value) in column.iter().enumerate() {
                if value != 0.0 {
                    indices.push(row);
                    data.push(value);
                }
            }
            indptr.push(data.len());
        }
        CscMatrix {
            nrows: dense.nrows(),
            ncols: dense.ncols(),
            indptr,
            indices,
            data,
        }
    }

    /// Expand to a dense array
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.nrows, self.ncols));
        for col in 0..self.ncols {
            for k in self.indptr[col]..self.indptr[col + 1] {
                dense[[self.indices[k], col]] = self.data[k];
            }
        }
        dense
    }

    /// Stored entries
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Column pointer array
    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }
}

/// Target layout of [`sparsify_and_convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseFormat {
    /// Row-compressed
    Csr,
    /// Column-compressed
    Csc,
}

/// A matrix in one of the sparse layouts.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum SparseMatrix {
    Csr(CsrMatrix),
    Csc(CscMatrix),
}

impl SparseMatrix {
    /// Expand to a dense array
    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            SparseMatrix::Csr(matrix) => matrix.to_dense(),
            SparseMatrix::Csc(matrix) => matrix.to_dense(),
        }
    }
}

/// Zero a random `fraction` of the entries of `dataset`, then return the
/// result as a CSR reference and in `format`.
pub fn sparsify_and_convert(
    dataset: &Array2<f64>,
    format: SparseFormat,
    fraction: f64,
    seed: u64,
) -> Result<(CsrMatrix, SparseMatrix)> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(KnnError::invalid_parameter(
            "fraction",
            fraction.to_string(),
            "must lie in [0, 1]",
        ));
    }

    let ncols = dataset.ncols();
    let mut sparse = dataset.as_standard_layout().into_owned();
    let amount = (dataset.len() as f64 * fraction) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    for position in rand::seq::index::sample(&mut rng, dataset.len(), amount) {
        sparse[[position / ncols, position % ncols]] = 0.0;
    }

    let converted = match format {
        SparseFormat::Csr => SparseMatrix::Csr(CsrMatrix::from_dense(sparse.view())),
        SparseFormat::Csc => SparseMatrix::Csc(CscMatrix::from_dense(sparse.view())),
    };
    Ok((CsrMatrix::from_dense(sparse.view()), converted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_csr_and_csc_expand_to_the_same_dense() {
        let dense = array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0]];
        let csr = CsrMatrix::from_dense(dense.view());
        let csc = CscMatrix::from_dense(dense.view());

        assert_eq!(csr.nnz(), 3);
        assert_eq!(csr.indptr(), &[0, 2, 3]);
        assert_eq!(csc.indptr(), &[0, 1, 1, 3]);
        assert_eq!(csr.to_dense(), dense);
        assert_eq!(csc.to_dense(), dense);
    }

    #[test]
    fn test_sparsify_zeroes_the_requested_fraction() {
        let dense = Array2::from_elem((10, 10), 1.0);
        let (reference, converted) =
            sparsify_and_convert(&dense, SparseFormat::Csc, 0.3, 11).unwrap();

        assert_eq!(reference.nnz(), 70);
        assert_eq!(converted.to_dense(), reference.to_dense());
        assert!(sparsify_and_convert(&dense, SparseFormat::Csr, 1.5, 0).is_err());
    }
}
