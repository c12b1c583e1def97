//! Kernels over sparse gradients.
//!
//! A sparse gradient is a list of row indices plus one row of values per index. Indices
//! may repeat; [`IndexedSlicesReduceSum`] folds repeats into one row each, and the lazy
//! updates then touch exactly those rows of the parameter and its optimizer state.

use std::marker::PhantomData;

use num_traits::{Float, PrimInt};

use crate::kernels::optimizer::{
    adam_row, check_len, momentum_row, sgd_row, AdamParams, MomentumParams, SgdParams,
};
use crate::kernels::{KernelError, RowRange};

/// Scratch space for [`IndexedSlicesReduceSum::reduce_sum`].
///
/// Owned by the caller and sized with [`IndexedSlicesReduceSum::workspace_len`]; the
/// kernel never grows it.
#[derive(Debug, Clone, Default)]
pub struct ReduceSumWorkspace {
    slots: Vec<usize>,
}

impl ReduceSumWorkspace {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceSumOutput {
    /// Distinct indices written to the front of the output buffers.
    pub num_unique: usize,
    pub row_len: usize,
}

impl ReduceSumOutput {
    /// Views the written prefix of the output buffers.
    pub fn rows<'a, K, T>(
        &self,
        unique_indices: &'a [K],
        unique_values: &'a [T],
    ) -> UniqueRows<'a, K, T> {
        UniqueRows {
            indices: &unique_indices[..self.num_unique],
            values: &unique_values[..self.num_unique * self.row_len],
            row_len: self.row_len,
        }
    }
}

/// Sparse rows whose indices are pairwise distinct.
#[derive(Debug, Clone, Copy)]
pub struct UniqueRows<'a, K, T> {
    pub indices: &'a [K],
    pub values: &'a [T],
    pub row_len: usize,
}

/// Sums the rows of repeated indices.
pub struct IndexedSlicesReduceSum<K, T> {
    _marker: PhantomData<(K, T)>,
}

impl<K: PrimInt, T: Float> IndexedSlicesReduceSum<K, T> {
    pub fn workspace_len(num_indices: usize, _row_len: usize) -> usize {
        num_indices
    }

    /// Writes one row per distinct index, in ascending index order.
    ///
    /// Rows sharing an index are added in their input order. Only the first
    /// `num_unique` indices and `num_unique * row_len` values of the outputs are
    /// written.
    pub fn reduce_sum(
        indices: &[K],
        values: &[T],
        unique_indices: &mut [K],
        unique_values: &mut [T],
        workspace: &mut ReduceSumWorkspace,
    ) -> Result<ReduceSumOutput, KernelError> {
        let n = indices.len();
        if n == 0 {
            if !values.is_empty() {
                return Err(KernelError::ValuesNotMultipleOfIndices {
                    indices: 0,
                    values: values.len(),
                });
            }
            return Ok(ReduceSumOutput {
                num_unique: 0,
                row_len: 0,
            });
        }
        if values.len() % n != 0 {
            return Err(KernelError::ValuesNotMultipleOfIndices {
                indices: n,
                values: values.len(),
            });
        }
        let row_len = values.len() / n;
        let required = Self::workspace_len(n, row_len);
        if workspace.len() < required {
            return Err(KernelError::WorkspaceTooSmall {
                required,
                actual: workspace.len(),
            });
        }

        let order = &mut workspace.slots[..n];
        for (slot, pos) in order.iter_mut().zip(0..) {
            *slot = pos;
        }
        order.sort_unstable_by_key(|&pos| (indices[pos], pos));

        let num_unique = 1 + order
            .windows(2)
            .filter(|pair| indices[pair[0]] != indices[pair[1]])
            .count();
        if unique_indices.len() < num_unique {
            return Err(KernelError::OutputTooSmall {
                buffer: "unique_indices",
                required: num_unique,
                actual: unique_indices.len(),
            });
        }
        if unique_values.len() < num_unique * row_len {
            return Err(KernelError::OutputTooSmall {
                buffer: "unique_values",
                required: num_unique * row_len,
                actual: unique_values.len(),
            });
        }

        unique_values[..num_unique * row_len].fill(T::zero());
        let mut out = 0;
        for (rank, &pos) in order.iter().enumerate() {
            if rank > 0 && indices[pos] != unique_indices[out] {
                out += 1;
            }
            unique_indices[out] = indices[pos];
            let src = &values[pos * row_len..(pos + 1) * row_len];
            let dst = &mut unique_values[out * row_len..(out + 1) * row_len];
            for (d, s) in dst.iter_mut().zip(src) {
                *d = *d + *s;
            }
        }
        Ok(ReduceSumOutput {
            num_unique,
            row_len,
        })
    }
}

/// Calls `f(local_row, values)` for every row this shard holds; returns how many.
///
/// Indices outside the shard are skipped, indices outside the parameter are an error.
fn for_each_local_row<K: PrimInt, T>(
    rows: &UniqueRows<'_, K, T>,
    range: RowRange,
    mut f: impl FnMut(usize, &[T]),
) -> Result<usize, KernelError> {
    let mut touched = 0;
    for (i, index) in rows.indices.iter().enumerate() {
        let global = index
            .to_usize()
            .filter(|row| *row < range.rows)
            .ok_or(KernelError::IndexOutOfRange {
                index: index.to_i64().unwrap_or(i64::MIN),
                rows: range.rows,
            })?;
        let Some(local) = range.local(global) else {
            continue;
        };
        f(local, &rows.values[i * rows.row_len..(i + 1) * rows.row_len]);
        touched += 1;
    }
    Ok(touched)
}

fn row_mut<T>(buffer: &mut [T], row: usize, row_len: usize) -> &mut [T] {
    &mut buffer[row * row_len..(row + 1) * row_len]
}

/// SGD restricted to the rows of `rows`; `model` holds the `range` rows of the parameter.
pub fn indexed_slices_sgd_update<K: PrimInt, T: Float>(
    model: &mut [T],
    rows: &UniqueRows<'_, K, T>,
    range: RowRange,
    params: &SgdParams<T>,
) -> Result<usize, KernelError> {
    let row_len = rows.row_len;
    check_len("indexed_slices_sgd_update", range.len() * row_len, model.len())?;
    for_each_local_row(rows, range, |row, diff| {
        sgd_row(row_mut(model, row, row_len), diff, params);
    })
}

pub fn indexed_slices_momentum_update<K: PrimInt, T: Float>(
    model: &mut [T],
    momentum: &mut [T],
    rows: &UniqueRows<'_, K, T>,
    range: RowRange,
    params: &MomentumParams<T>,
) -> Result<usize, KernelError> {
    let row_len = rows.row_len;
    check_len("indexed_slices_momentum_update", range.len() * row_len, model.len())?;
    check_len("indexed_slices_momentum_update", model.len(), momentum.len())?;
    for_each_local_row(rows, range, |row, diff| {
        momentum_row(
            row_mut(model, row, row_len),
            row_mut(momentum, row, row_len),
            diff,
            params,
        );
    })
}

/// Adam that leaves the moments of untouched rows as they are.
pub fn indexed_slices_lazy_adam_update<K: PrimInt, T: Float>(
    model: &mut [T],
    m: &mut [T],
    v: &mut [T],
    rows: &UniqueRows<'_, K, T>,
    range: RowRange,
    params: &AdamParams<T>,
) -> Result<usize, KernelError> {
    let row_len = rows.row_len;
    check_len("indexed_slices_lazy_adam_update", range.len() * row_len, model.len())?;
    check_len("indexed_slices_lazy_adam_update", model.len(), m.len())?;
    check_len("indexed_slices_lazy_adam_update", model.len(), v.len())?;
    let step_size = params.step_size();
    for_each_local_row(rows, range, |row, diff| {
        adam_row(
            row_mut(model, row, row_len),
            row_mut(m, row, row_len),
            row_mut(v, row, row_len),
            diff,
            params,
            step_size,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type ReduceSum = IndexedSlicesReduceSum<i64, f32>;

    fn reduce(indices: &[i64], values: &[f32]) -> (Vec<i64>, Vec<f32>) {
        let row_len = values.len() / indices.len();
        let mut workspace = ReduceSumWorkspace::new(ReduceSum::workspace_len(indices.len(), row_len));
        let mut unique_indices = vec![-1; indices.len()];
        let mut unique_values = vec![f32::NAN; values.len()];
        let output = ReduceSum::reduce_sum(
            indices,
            values,
            &mut unique_indices,
            &mut unique_values,
            &mut workspace,
        )
        .expect("reduce sum");
        let rows = output.rows(&unique_indices, &unique_values);
        (rows.indices.to_vec(), rows.values.to_vec())
    }

    #[test]
    fn repeated_indices_are_summed_in_ascending_order() {
        let (indices, values) = reduce(&[3, 1, 3, 2, 1, 1], &[10.0, 20.0, 10.0, 5.0, 10.0, 10.0]);
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(values, vec![40.0, 5.0, 20.0]);
    }

    #[test]
    fn rows_keep_their_width() {
        let (indices, values) = reduce(&[4, 0, 4], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(indices, vec![0, 4]);
        assert_eq!(values, vec![3.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn values_must_split_into_rows() {
        let mut workspace = ReduceSumWorkspace::new(2);
        let err = ReduceSum::reduce_sum(
            &[0, 1],
            &[1.0, 2.0, 3.0],
            &mut [0; 2],
            &mut [0.0; 3],
            &mut workspace,
        )
        .unwrap_err();
        assert_eq!(
            err,
            KernelError::ValuesNotMultipleOfIndices {
                indices: 2,
                values: 3
            }
        );
    }

    #[test]
    fn undersized_workspace_is_rejected() {
        let mut workspace = ReduceSumWorkspace::new(1);
        let err = ReduceSum::reduce_sum(
            &[0, 1, 0],
            &[1.0, 2.0, 3.0],
            &mut [0; 3],
            &mut [0.0; 3],
            &mut workspace,
        )
        .unwrap_err();
        assert_eq!(
            err,
            KernelError::WorkspaceTooSmall {
                required: 3,
                actual: 1
            }
        );
        assert_eq!(workspace.len(), 1);
    }

    #[test]
    fn lazy_adam_leaves_untouched_rows_bit_identical() {
        let model_before: Vec<f32> = (0..12).map(|i| 0.1 * i as f32).collect();
        let mut model = model_before.clone();
        let mut m = vec![0.25f32; 12];
        let mut v = vec![0.5f32; 12];
        let (indices, values) = reduce(&[3, 1, 3], &[1.0, -1.0, 2.0, 2.0, 0.5, 0.5]);
        let rows = UniqueRows {
            indices: &indices,
            values: &values,
            row_len: 2,
        };
        let params = AdamParams {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            do_bias_correction: true,
            train_step: 4,
        };
        let touched =
            indexed_slices_lazy_adam_update(&mut model, &mut m, &mut v, &rows, RowRange::all(6), &params)
                .expect("lazy adam");

        assert_eq!(touched, 2);
        for row in [0, 2, 4, 5] {
            let span = row * 2..row * 2 + 2;
            assert_eq!(model[span.clone()], model_before[span.clone()], "row {row}");
            assert!(m[span.clone()].iter().all(|x| x.to_bits() == 0.25f32.to_bits()));
            assert!(v[span].iter().all(|x| x.to_bits() == 0.5f32.to_bits()));
        }
        assert_ne!(model[2..4], model_before[2..4]);
        assert_ne!(model[6..8], model_before[6..8]);
    }

    #[test]
    fn rows_outside_the_shard_are_skipped() {
        let mut model = vec![1.0f32; 3];
        let indices = [0i64, 2, 4];
        let values = [1.0f32, 1.0, 1.0];
        let rows = UniqueRows {
            indices: &indices,
            values: &values,
            row_len: 1,
        };
        let params = SgdParams {
            learning_rate: 1.0,
            weight_decay: 0.0,
        };
        let touched = indexed_slices_sgd_update(&mut model, &rows, RowRange::new(2, 5, 8), &params)
            .expect("sgd");
        assert_eq!(touched, 2);
        assert_eq!(model, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn negative_index_is_rejected() {
        let mut model = vec![0.0f32; 2];
        let mut momentum = vec![0.0f32; 2];
        let indices = [-1i64];
        let values = [1.0f32];
        let rows = UniqueRows {
            indices: &indices,
            values: &values,
            row_len: 1,
        };
        let params = MomentumParams {
            learning_rate: 1.0,
            beta: 0.9,
            weight_decay: 0.0,
        };
        let err = indexed_slices_momentum_update(&mut model, &mut momentum, &rows, RowRange::all(2), &params)
            .unwrap_err();
        assert_eq!(err, KernelError::IndexOutOfRange { index: -1, rows: 2 });
    }

    #[test]
    fn index_past_the_parameter_is_rejected() {
        let indices = [1i64, 3];
        let values = [1.0f32, 1.0];
        let rows = UniqueRows {
            indices: &indices,
            values: &values,
            row_len: 1,
        };
        let params = SgdParams {
            learning_rate: 1.0,
            weight_decay: 0.0,
        };

        let mut model = vec![1.0f32; 3];
        let err = indexed_slices_sgd_update(&mut model, &rows, RowRange::all(3), &params).unwrap_err();
        assert_eq!(err, KernelError::IndexOutOfRange { index: 3, rows: 3 });

        let mut shard = vec![1.0f32; 2];
        let err = indexed_slices_sgd_update(&mut shard, &rows, RowRange::new(0, 2, 3), &params)
            .unwrap_err();
        assert_eq!(err, KernelError::IndexOutOfRange { index: 3, rows: 3 });
    }

    #[test]
    fn reduction_order_is_stable_across_runs() {
        let indices = [9i64, 2, 7, 2, 9, 0, 7, 7];
        let values: Vec<f32> = (0..16).map(|i| 0.37 * i as f32 - 2.0).collect();
        let first = reduce(&indices, &values);
        for _ in 0..4 {
            let again = reduce(&indices, &values);
            assert_eq!(again.0, first.0);
            let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&again.1), bits(&first.1));
        }
        assert_eq!(first.0, vec![0, 2, 7, 9]);
    }
}
