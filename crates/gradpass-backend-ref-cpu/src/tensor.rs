use gradpass::job::DType;

use crate::kernels::KernelError;

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// Dense row-major tensor in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl HostTensor {
    pub fn f32(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Self {
        Self {
            shape: shape.into(),
            data: TensorData::F32(data),
        }
    }

    pub fn i64(shape: impl Into<Vec<usize>>, data: Vec<i64>) -> Self {
        Self {
            shape: shape.into(),
            data: TensorData::I64(data),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self::f32([1], vec![value])
    }

    pub fn full(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::f32(shape, vec![value; len])
    }

    pub fn zeros(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        match dtype {
            DType::F32 => Self::f32(shape, vec![0.0; len]),
            DType::I32 | DType::I64 => Self::i64(shape, vec![0; len]),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn as_f32(&self) -> Result<&[f32], KernelError> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            TensorData::I64(_) => Err(KernelError::DTypeMismatch { expected: DType::F32 }),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32], KernelError> {
        match &mut self.data {
            TensorData::F32(values) => Ok(values),
            TensorData::I64(_) => Err(KernelError::DTypeMismatch { expected: DType::F32 }),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64], KernelError> {
        match &self.data {
            TensorData::I64(values) => Ok(values),
            TensorData::F32(_) => Err(KernelError::DTypeMismatch { expected: DType::I64 }),
        }
    }

    pub fn as_i64_mut(&mut self) -> Result<&mut [i64], KernelError> {
        match &mut self.data {
            TensorData::I64(values) => Ok(values),
            TensorData::F32(_) => Err(KernelError::DTypeMismatch { expected: DType::I64 }),
        }
    }

    /// First element as a float; used for `[1]`-shaped scalars.
    pub fn scalar_value(&self) -> Result<f32, KernelError> {
        let value = match &self.data {
            TensorData::F32(values) => values.first().copied(),
            TensorData::I64(values) => values.first().map(|v| *v as f32),
        };
        value.ok_or(KernelError::ShapeMismatch {
            op: "scalar",
            expected: vec![1],
            actual: self.shape.clone(),
        })
    }
}

/// Sparse gradient: `indices.len()` rows of `dense_shape[1..]` elements each.
///
/// Repeated indices are additive.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSlices {
    pub indices: Vec<i64>,
    pub values: Vec<f32>,
    pub dense_shape: Vec<usize>,
}

impl IndexedSlices {
    pub fn row_len(&self) -> usize {
        self.dense_shape.iter().skip(1).product()
    }

    pub fn rows(&self) -> usize {
        self.dense_shape.first().copied().unwrap_or(0)
    }

    pub fn to_dense(&self) -> Result<HostTensor, KernelError> {
        let row_len = self.row_len();
        if self.values.len() != self.indices.len() * row_len {
            return Err(KernelError::ValuesNotMultipleOfIndices {
                indices: self.indices.len(),
                values: self.values.len(),
            });
        }
        let rows = self.rows();
        let mut dense = vec![0.0f32; rows * row_len];
        for (pos, &index) in self.indices.iter().enumerate() {
            let row = usize::try_from(index)
                .ok()
                .filter(|row| *row < rows)
                .ok_or(KernelError::IndexOutOfRange { index, rows })?;
            let src = &self.values[pos * row_len..(pos + 1) * row_len];
            for (dst, value) in dense[row * row_len..(row + 1) * row_len].iter_mut().zip(src) {
                *dst += *value;
            }
        }
        Ok(HostTensor::f32(self.dense_shape.clone(), dense))
    }

    /// Applies `f` to every stored value, keeping the indices.
    pub fn map_values(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            indices: self.indices.clone(),
            values: self.values.iter().map(|v| f(*v)).collect(),
            dense_shape: self.dense_shape.clone(),
        }
    }
}

/// Runtime value of one logical blob.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Dense(HostTensor),
    Slices(IndexedSlices),
}

impl Value {
    pub fn to_dense(&self) -> Result<HostTensor, KernelError> {
        match self {
            Value::Dense(tensor) => Ok(tensor.clone()),
            Value::Slices(slices) => slices.to_dense(),
        }
    }

    pub fn as_dense(&self) -> Option<&HostTensor> {
        match self {
            Value::Dense(tensor) => Some(tensor),
            Value::Slices(_) => None,
        }
    }

    pub fn as_slices(&self) -> Option<&IndexedSlices> {
        match self {
            Value::Slices(slices) => Some(slices),
            Value::Dense(_) => None,
        }
    }
}
