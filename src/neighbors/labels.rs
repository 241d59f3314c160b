//! Distinct class labels of every output target.

use crate::core::types::ClassLabel;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One sorted set of distinct labels per output target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueLabelSet {
    per_target: Vec<Vec<ClassLabel>>,
}

impl UniqueLabelSet {
    /// Distinct values of every column of `labels`
    pub fn from_labels(labels: ArrayView2<'_, ClassLabel>) -> Self {
        let per_target = labels
            .columns()
            .into_iter()
            .map(|column| {
                column
                    .iter()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .collect();
        UniqueLabelSet { per_target }
    }

    /// Number of output targets
    pub fn n_targets(&self) -> usize {
        self.per_target.len()
    }

    /// Number of distinct labels of each target
    pub fn cardinalities(&self) -> Vec<usize> {
        self.per_target.iter().map(Vec::len).collect()
    }

    /// Sorted distinct labels of `target`
    pub fn labels(&self, target: usize) -> Option<&[ClassLabel]> {
        self.per_target.get(target).map(Vec::as_slice)
    }

    /// Column of `label` in the probability matrix of `target`
    pub fn position(&self, target: usize, label: ClassLabel) -> Option<usize> {
        self.per_target.get(target)?.binary_search(&label).ok()
    }
}
