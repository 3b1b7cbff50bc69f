//! Dense tensor vocabulary used by the scheduler and the attention-side accessors.
//!
//! Two kinds of buffers live here:
//! - [`IndexTensor`]: dense `i64` metadata (block tables, slot mappings)
//! - [`KvStorage`]: one typed per-shard backing buffer of the paged cache
//!
//! Both are row-major; offsets are always computed from explicit strides.

use std::slice::{ChunksExact, ChunksExactMut};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element type of a cache storage buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    Bf16,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::Bf16 => 2,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Memory pool a buffer is drawn from.
///
/// `Shared` marks host-visible memory the device can read directly
/// (pinned / unified), which is what the kernel-facing buffers want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPool {
    #[default]
    Host,
    Shared,
}

/// Row-major strides (in elements) for a shape.
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Linear element offset of `index` under `strides`.
pub fn linear_offset(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Total number of elements in a shape.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Total number of elements in a shape, or `None` if it overflows `usize`.
pub fn checked_num_elements(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, n| acc.checked_mul(*n))
}

/// Dense signed 64-bit tensor, used for all scheduler metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    data: Vec<i64>,
    pool: MemoryPool,
}

impl IndexTensor {
    /// Allocate a zero-filled tensor.
    pub fn zeros(shape: &[usize], pool: MemoryPool) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            data: vec![0; num_elements(shape)],
            pool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    /// Extent of the outermost dimension.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat element view.
    pub fn as_slice(&self) -> &[i64] {
        &self.data
    }

    /// Element at a full index, or `None` if out of bounds.
    pub fn get(&self, index: &[usize]) -> Option<i64> {
        if !self.in_bounds(index, self.shape.len()) {
            return None;
        }
        self.data.get(linear_offset(index, &self.strides)).copied()
    }

    /// Innermost row addressed by `prefix` (all dimensions but the last).
    pub fn row(&self, prefix: &[usize]) -> Option<&[i64]> {
        let (start, inner) = self.row_span(prefix)?;
        self.data.get(start..start + inner)
    }

    /// Mutable innermost row addressed by `prefix`.
    pub fn row_mut(&mut self, prefix: &[usize]) -> Option<&mut [i64]> {
        let (start, inner) = self.row_span(prefix)?;
        self.data.get_mut(start..start + inner)
    }

    /// Iterate innermost rows in row-major order.
    pub fn rows(&self) -> ChunksExact<'_, i64> {
        let inner = self.shape.last().copied().unwrap_or(0).max(1);
        self.data.chunks_exact(inner)
    }

    /// Iterate innermost rows mutably in row-major order.
    pub fn rows_mut(&mut self) -> ChunksExactMut<'_, i64> {
        let inner = self.shape.last().copied().unwrap_or(0).max(1);
        self.data.chunks_exact_mut(inner)
    }

    pub fn as_mut_slice(&mut self) -> &mut [i64] {
        &mut self.data
    }

    fn row_span(&self, prefix: &[usize]) -> Option<(usize, usize)> {
        let ndim = self.shape.len();
        if ndim == 0 || prefix.len() != ndim - 1 || !self.in_bounds(prefix, ndim - 1) {
            return None;
        }
        Some((linear_offset(prefix, &self.strides), self.shape[ndim - 1]))
    }

    fn in_bounds(&self, index: &[usize], ndim: usize) -> bool {
        index.len() == ndim && index.iter().zip(&self.shape).all(|(i, d)| i < d)
    }
}

/// Typed contents of a storage handle.
#[derive(Debug, Clone)]
pub enum StorageBuffer {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
}

impl StorageBuffer {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => StorageBuffer::F32(vec![0.0; len]),
            DType::F16 => StorageBuffer::F16(vec![f16::ZERO; len]),
            DType::Bf16 => StorageBuffer::Bf16(vec![bf16::ZERO; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            StorageBuffer::F32(_) => DType::F32,
            StorageBuffer::F16(_) => DType::F16,
            StorageBuffer::Bf16(_) => DType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StorageBuffer::F32(v) => v.len(),
            StorageBuffer::F16(v) => v.len(),
            StorageBuffer::Bf16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes, as a kernel would receive them.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StorageBuffer::F32(v) => bytemuck::cast_slice(v),
            StorageBuffer::F16(v) => bytemuck::cast_slice(v),
            StorageBuffer::Bf16(v) => bytemuck::cast_slice(v),
        }
    }

    fn read(&self, offset: usize) -> Option<f32> {
        match self {
            StorageBuffer::F32(v) => v.get(offset).copied(),
            StorageBuffer::F16(v) => v.get(offset).map(|x| x.to_f32()),
            StorageBuffer::Bf16(v) => v.get(offset).map(|x| x.to_f32()),
        }
    }

    fn write(&mut self, offset: usize, value: f32) -> bool {
        let written = match self {
            StorageBuffer::F32(v) => v.get_mut(offset).map(|x| *x = value),
            StorageBuffer::F16(v) => v.get_mut(offset).map(|x| *x = f16::from_f32(value)),
            StorageBuffer::Bf16(v) => v.get_mut(offset).map(|x| *x = bf16::from_f32(value)),
        };
        written.is_some()
    }
}

/// One per-shard backing buffer of the paged cache, shaped by the local
/// (non-sharded) portion of the cache layout.
#[derive(Debug, Clone)]
pub struct KvStorage {
    shape: Vec<usize>,
    strides: Vec<usize>,
    buffer: StorageBuffer,
    pool: MemoryPool,
}

impl KvStorage {
    /// Allocate a zero-filled storage buffer.
    pub fn zeros(shape: &[usize], dtype: DType, pool: MemoryPool) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            buffer: StorageBuffer::zeros(dtype, num_elements(shape)),
            pool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn pool(&self) -> MemoryPool {
        self.pool
    }

    pub fn num_elements(&self) -> usize {
        self.buffer.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.dtype().size_in_bytes()
    }

    pub fn buffer(&self) -> &StorageBuffer {
        &self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    pub(crate) fn read(&self, offset: usize) -> Option<f32> {
        self.buffer.read(offset)
    }

    pub(crate) fn write(&mut self, offset: usize, value: f32) -> bool {
        self.buffer.write(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
        assert_eq!(checked_num_elements(&[2, 3, 4]), Some(24));
        assert_eq!(checked_num_elements(&[usize::MAX, 2]), None);
        assert_eq!(checked_num_elements(&[usize::MAX, 0]), Some(0));
        assert_eq!(linear_offset(&[1, 2, 3], &[12, 4, 1]), 23);
    }

    #[test]
    fn test_index_tensor_rows() {
        let mut t = IndexTensor::zeros(&[2, 3, 2], MemoryPool::Shared);
        t.row_mut(&[1, 2]).unwrap().copy_from_slice(&[7, -1]);

        assert_eq!(t.get(&[1, 2, 0]), Some(7));
        assert_eq!(t.get(&[1, 2, 1]), Some(-1));
        assert_eq!(t.get(&[2, 0, 0]), None);
        assert_eq!(t.row(&[0, 0]), Some(&[0, 0][..]));
        assert!(t.row(&[0]).is_none());
        assert_eq!(t.rows().count(), 6);
        assert_eq!(t.len(), 2);
        assert_eq!(t.pool(), MemoryPool::Shared);
    }

    #[test]
    fn test_fill_rows_then_move() {
        let mut t = IndexTensor::zeros(&[3, 2], MemoryPool::Host);
        let mut rows = t.rows_mut();
        for (i, row) in rows.by_ref().take(2).enumerate() {
            row[0] = i as i64 + 1;
        }
        for row in rows {
            row[1] = -1;
        }
        let moved = t;
        assert_eq!(moved.as_slice(), &[1, 0, 2, 0, 0, -1]);
    }

    #[test]
    fn test_empty_index_tensor() {
        let t = IndexTensor::zeros(&[0, 1], MemoryPool::Host);
        assert!(t.is_empty());
        assert_eq!(t.rows().count(), 0);
    }

    #[test]
    fn test_storage_dtype_conversion() {
        let mut s = KvStorage::zeros(&[2, 4], DType::F16, MemoryPool::Host);
        assert_eq!(s.size_in_bytes(), 16);
        assert_eq!(s.as_bytes().len(), 16);

        assert!(s.write(5, 1.5));
        assert_eq!(s.read(5), Some(1.5));
        assert!(!s.write(8, 1.0));
        assert_eq!(s.read(8), None);
    }
}
