//! Forward and backward tensor math on host tensors.

use crate::kernels::KernelError;
use crate::tensor::HostTensor;

fn shape_mismatch(op: &'static str, expected: &[usize], actual: &[usize]) -> KernelError {
    KernelError::ShapeMismatch {
        op,
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    }
}

fn matrix_dims(op: &'static str, shape: &[usize], transpose: bool) -> Result<(usize, usize), KernelError> {
    match shape {
        [rows, cols] if transpose => Ok((*cols, *rows)),
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(shape_mismatch(op, &[0, 0], shape)),
    }
}

/// `op(a) x op(b)` for rank-2 operands, where `op` optionally transposes.
pub fn matmul(
    a: &HostTensor,
    b: &HostTensor,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<HostTensor, KernelError> {
    let (m, k) = matrix_dims("matmul", &a.shape, transpose_a)?;
    let (kb, n) = matrix_dims("matmul", &b.shape, transpose_b)?;
    if k != kb {
        return Err(shape_mismatch("matmul", &[k, n], &[kb, n]));
    }
    let (lhs, rhs) = (a.as_f32()?, b.as_f32()?);
    let at = |i: usize, p: usize| {
        if transpose_a {
            lhs[p * m + i]
        } else {
            lhs[i * k + p]
        }
    };
    let bt = |p: usize, j: usize| {
        if transpose_b {
            rhs[j * k + p]
        } else {
            rhs[p * n + j]
        }
    };
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).fold(0.0, |acc, p| acc + at(i, p) * bt(p, j));
        }
    }
    Ok(HostTensor::f32([m, n], out))
}

pub fn add_n(inputs: &[&HostTensor]) -> Result<HostTensor, KernelError> {
    let Some(first) = inputs.first() else {
        return Err(shape_mismatch("add", &[1], &[]));
    };
    let mut out = first.as_f32()?.to_vec();
    for input in &inputs[1..] {
        if input.shape != first.shape {
            return Err(shape_mismatch("add", &first.shape, &input.shape));
        }
        for (acc, value) in out.iter_mut().zip(input.as_f32()?) {
            *acc += *value;
        }
    }
    Ok(HostTensor::f32(first.shape.clone(), out))
}

pub fn multiply(x: &HostTensor, y: &HostTensor) -> Result<HostTensor, KernelError> {
    if x.shape != y.shape {
        return Err(shape_mismatch("multiply", &x.shape, &y.shape));
    }
    let out = x
        .as_f32()?
        .iter()
        .zip(y.as_f32()?)
        .map(|(a, b)| a * b)
        .collect();
    Ok(HostTensor::f32(x.shape.clone(), out))
}

/// Elementwise `f` over a float tensor.
pub fn map(x: &HostTensor, f: impl Fn(f32) -> f32) -> Result<HostTensor, KernelError> {
    let out = x.as_f32()?.iter().map(|v| f(*v)).collect();
    Ok(HostTensor::f32(x.shape.clone(), out))
}

pub fn relu(x: &HostTensor) -> Result<HostTensor, KernelError> {
    map(x, |v| v.max(0.0))
}

/// Passes `dy` where the forward output `y` was positive.
pub fn relu_grad(y: &HostTensor, dy: &HostTensor) -> Result<HostTensor, KernelError> {
    if y.shape != dy.shape {
        return Err(shape_mismatch("relu_grad", &y.shape, &dy.shape));
    }
    let out = y
        .as_f32()?
        .iter()
        .zip(dy.as_f32()?)
        .map(|(y, dy)| if *y > 0.0 { *dy } else { 0.0 })
        .collect();
    Ok(HostTensor::f32(y.shape.clone(), out))
}

/// Offset in the reduced tensor of every element of `shape` when `axes` are summed away.
fn reduced_offsets(op: &'static str, shape: &[usize], axes: &[usize]) -> Result<Vec<usize>, KernelError> {
    if let Some(axis) = axes.iter().find(|axis| **axis >= shape.len()) {
        return Err(shape_mismatch(op, shape, &[*axis]));
    }
    let mut strides = vec![0usize; shape.len()];
    let mut stride = 1;
    for dim in (0..shape.len()).rev() {
        if !axes.contains(&dim) {
            strides[dim] = stride;
            stride *= shape[dim];
        }
    }
    let total: usize = shape.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..total {
        offsets.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Ok(offsets)
}

fn reduced_shape(shape: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    let shape: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter_map(|(dim, len)| match (axes.contains(&dim), keepdims) {
            (false, _) => Some(*len),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    if shape.is_empty() {
        vec![1]
    } else {
        shape
    }
}

/// Sums over `axes`; a full reduction without `keepdims` yields shape `[1]`.
pub fn reduce_sum(x: &HostTensor, axes: &[usize], keepdims: bool) -> Result<HostTensor, KernelError> {
    let offsets = reduced_offsets("reduce_sum", &x.shape, axes)?;
    let shape = reduced_shape(&x.shape, axes, keepdims);
    let mut out = vec![0.0f32; shape.iter().product()];
    for (offset, value) in offsets.iter().zip(x.as_f32()?) {
        out[*offset] += *value;
    }
    Ok(HostTensor::f32(shape, out))
}

/// Inverse of [`reduce_sum`]: repeats `x` along `axes` up to `like_shape`.
pub fn broadcast_like(
    x: &HostTensor,
    like_shape: &[usize],
    axes: &[usize],
) -> Result<HostTensor, KernelError> {
    let offsets = reduced_offsets("broadcast_like", like_shape, axes)?;
    let expected = reduced_shape(like_shape, axes, false);
    let values = x.as_f32()?;
    if values.len() != expected.iter().product::<usize>() {
        return Err(shape_mismatch("broadcast_like", &expected, &x.shape));
    }
    let out = offsets.iter().map(|offset| values[*offset]).collect();
    Ok(HostTensor::f32(like_shape.to_vec(), out))
}

fn checked_row(index: i64, rows: usize) -> Result<usize, KernelError> {
    usize::try_from(index)
        .ok()
        .filter(|row| *row < rows)
        .ok_or(KernelError::IndexOutOfRange { index, rows })
}

/// Rows of `table` selected by `indices`; the result has shape `indices.shape ++ table.shape[1..]`.
pub fn gather(table: &HostTensor, indices: &HostTensor) -> Result<HostTensor, KernelError> {
    let rows = table.shape.first().copied().unwrap_or(0);
    let row_len: usize = table.shape.iter().skip(1).product();
    let values = table.as_f32()?;
    let mut out = Vec::with_capacity(indices.element_count() * row_len);
    for index in indices.as_i64()? {
        let row = checked_row(*index, rows)?;
        out.extend_from_slice(&values[row * row_len..(row + 1) * row_len]);
    }
    let mut shape = indices.shape.clone();
    shape.extend_from_slice(&table.shape[1.min(table.shape.len())..]);
    Ok(HostTensor::f32(shape, out))
}

/// Adds row `i` of `data` into row `segment_ids[i]` of a zero tensor shaped `like_shape`.
pub fn unsorted_segment_sum(
    data: &HostTensor,
    segment_ids: &HostTensor,
    like_shape: &[usize],
) -> Result<HostTensor, KernelError> {
    let rows = like_shape.first().copied().unwrap_or(0);
    let row_len: usize = like_shape.iter().skip(1).product();
    let ids = segment_ids.as_i64()?;
    let values = data.as_f32()?;
    if values.len() != ids.len() * row_len {
        return Err(KernelError::ValuesNotMultipleOfIndices {
            indices: ids.len(),
            values: values.len(),
        });
    }
    let mut out = vec![0.0f32; rows * row_len];
    for (pos, id) in ids.iter().enumerate() {
        let row = checked_row(*id, rows)?;
        let src = &values[pos * row_len..(pos + 1) * row_len];
        for (dst, value) in out[row * row_len..(row + 1) * row_len].iter_mut().zip(src) {
            *dst += *value;
        }
    }
    Ok(HostTensor::f32(like_shape.to_vec(), out))
}

/// Index of the largest element along the last axis.
pub fn argmax(x: &HostTensor) -> Result<HostTensor, KernelError> {
    let Some((&last, outer)) = x.shape.split_last() else {
        return Err(shape_mismatch("argmax", &[1], &x.shape));
    };
    if last == 0 {
        return Err(shape_mismatch("argmax", &[1], &x.shape));
    }
    let out = x
        .as_f32()?
        .chunks(last)
        .map(|row| {
            let mut best = 0;
            for (i, value) in row.iter().enumerate() {
                if *value > row[best] {
                    best = i;
                }
            }
            best as i64
        })
        .collect();
    let shape = if outer.is_empty() { vec![1] } else { outer.to_vec() };
    Ok(HostTensor::i64(shape, out))
}

pub fn square_sum(values: &[f32]) -> HostTensor {
    HostTensor::scalar(values.iter().map(|v| v * v).sum())
}
