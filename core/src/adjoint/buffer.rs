//! Transient adjoint storage for one handle invocation.
//!
//! An [`AdjointBuffer`] holds `elements` vectors of `width` reals. It is
//! created inside a callback and dropped before the callback returns, on the
//! error path as well.

use super::codec;
use crate::error::{AdError, Result};
use crate::tape::{AdjointInterface, TapeIndex};
use adcomm_kernels::sum_rank_blocks;

#[derive(Debug, Clone, PartialEq)]
pub struct AdjointBuffer {
    data: Vec<f64>,
    elements: usize,
    width: usize,
}

impl AdjointBuffer {
    /// A zeroed buffer.
    pub fn allocate(elements: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; elements * width],
            elements,
            width,
        }
    }

    pub fn from_vec(data: Vec<f64>, width: usize) -> Result<Self> {
        let width = width.max(1);
        if data.len() % width != 0 {
            return Err(AdError::Protocol(format!(
                "{} adjoint reals do not split into vectors of width {width}",
                data.len()
            )));
        }
        Ok(Self {
            elements: data.len() / width,
            data,
            width,
        })
    }

    pub fn from_bytes(bytes: &[u8], width: usize) -> Result<Self> {
        Self::from_vec(codec::decode_reals(bytes)?, width)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode_reals(&self.data)
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    fn check_indices(&self, indices: &[TapeIndex]) -> Result<()> {
        if indices.len() != self.elements {
            return Err(AdError::Protocol(format!(
                "adjoint buffer holds {} vectors but {} tape indices were given",
                self.elements,
                indices.len()
            )));
        }
        Ok(())
    }

    fn vectors_mut(&mut self) -> std::slice::ChunksExactMut<'_, f64> {
        self.data.chunks_exact_mut(self.width)
    }

    /// Claims the adjoints of `indices`: copies them in and resets them on the tape.
    pub fn pull(&mut self, adjoints: &mut dyn AdjointInterface, indices: &[TapeIndex]) -> Result<()> {
        self.check_indices(indices)?;
        for (vector, &index) in self.vectors_mut().zip(indices) {
            adjoints.get_adjoint_vec(index, vector);
            adjoints.reset_adjoint_vec(index);
        }
        Ok(())
    }

    /// Copies the vectors of `indices` in without resetting them (tangent sweep).
    pub fn read(&mut self, adjoints: &dyn AdjointInterface, indices: &[TapeIndex]) -> Result<()> {
        self.check_indices(indices)?;
        for (vector, &index) in self.vectors_mut().zip(indices) {
            adjoints.get_adjoint_vec(index, vector);
        }
        Ok(())
    }

    /// Adds vector `i` onto the adjoint of `indices[i]`.
    pub fn push(&self, adjoints: &mut dyn AdjointInterface, indices: &[TapeIndex]) -> Result<()> {
        self.check_indices(indices)?;
        for (vector, &index) in self.data.chunks_exact(self.width).zip(indices) {
            adjoints.update_adjoint_vec(index, vector);
        }
        Ok(())
    }

    /// Overwrites the vector of `indices[i]` with vector `i` (tangent sweep).
    pub fn store(&self, adjoints: &mut dyn AdjointInterface, indices: &[TapeIndex]) -> Result<()> {
        self.check_indices(indices)?;
        for (vector, &index) in self.data.chunks_exact(self.width).zip(indices) {
            adjoints.set_adjoint_vec(index, vector);
        }
        Ok(())
    }

    /// Treats the buffer as `ranks` consecutive blocks, sums them into block
    /// `0` in ascending rank order and shrinks the buffer to that block.
    pub fn combine_ranks(&mut self, ranks: usize) -> Result<()> {
        if ranks == 0 || self.elements % ranks != 0 {
            return Err(AdError::Protocol(format!(
                "{} adjoint vectors do not split into {ranks} rank blocks",
                self.elements
            )));
        }
        let per_rank = self.elements / ranks;
        sum_rank_blocks(&mut self.data, per_rank, ranks, self.width)?;
        self.data.truncate(per_rank * self.width);
        self.elements = per_rank;
        Ok(())
    }

    /// Vectors `start..start + len` as a new buffer.
    pub fn slice(&self, start: usize, len: usize) -> Result<Self> {
        if start + len > self.elements {
            return Err(AdError::Protocol(format!(
                "adjoint range {start}..{} out of bounds for {} vectors",
                start + len,
                self.elements
            )));
        }
        Ok(Self {
            data: self.data[start * self.width..(start + len) * self.width].to_vec(),
            elements: len,
            width: self.width,
        })
    }

    /// Appends the vectors of `other`.
    pub fn extend(&mut self, other: &AdjointBuffer) {
        self.data.extend_from_slice(&other.data);
        self.elements += other.elements;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_claims_adjoints() {
        let idx = [TapeIndex::new(1), TapeIndex::new(2)];
        let mut store = TestStore::new(2);
        store.set_adjoint_vec(idx[0], &[1.0, 2.0]);
        store.set_adjoint_vec(idx[1], &[3.0, 4.0]);

        let mut buf = AdjointBuffer::allocate(2, 2);
        buf.pull(&mut store, &idx).unwrap();
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0, 4.0]);

        let mut out = [9.0; 2];
        store.get_adjoint_vec(idx[0], &mut out);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_read_and_store_do_not_accumulate() {
        let idx = [TapeIndex::new(3)];
        let mut store = TestStore::new(1);
        store.set_adjoint_vec(idx[0], &[4.0]);

        let mut buf = AdjointBuffer::allocate(1, 1);
        buf.read(&store, &idx).unwrap();
        assert_eq!(buf.as_slice(), &[4.0]);

        let twice = AdjointBuffer::from_vec(vec![2.0], 1).unwrap();
        twice.store(&mut store, &idx).unwrap();
        twice.store(&mut store, &idx).unwrap();
        let mut out = [0.0];
        store.get_adjoint_vec(idx[0], &mut out);
        assert_eq!(out, [2.0]);
    }

    #[test]
    fn test_push_is_additive_and_skips_passive() {
        let mut store = TestStore::new(1);
        let idx = [TapeIndex::new(1), TapeIndex::PASSIVE];
        store.set_adjoint_vec(idx[0], &[5.0]);

        let buf = AdjointBuffer::from_vec(vec![2.0, 7.0], 1).unwrap();
        buf.push(&mut store, &idx).unwrap();
        buf.push(&mut store, &idx).unwrap();

        let mut out = [0.0];
        store.get_adjoint_vec(idx[0], &mut out);
        assert_eq!(out, [9.0]);
        store.get_adjoint_vec(TapeIndex::PASSIVE, &mut out);
        assert_eq!(out, [0.0]);
    }

    #[test]
    fn test_combine_ranks_ascending() {
        // 3 ranks x 1 element x width 2
        let mut buf = AdjointBuffer::from_vec(vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0], 2).unwrap();
        buf.combine_ranks(3).unwrap();
        assert_eq!(buf.elements(), 1);
        assert_eq!(buf.as_slice(), &[111.0, 222.0]);

        let mut odd = AdjointBuffer::allocate(3, 1);
        assert!(matches!(odd.combine_ranks(2), Err(AdError::Protocol(_))));
    }

    #[test]
    fn test_index_count_mismatch() {
        let mut store = TestStore::new(1);
        let mut buf = AdjointBuffer::allocate(2, 1);
        assert!(matches!(
            buf.pull(&mut store, &[TapeIndex::new(1)]),
            Err(AdError::Protocol(_))
        ));
    }

    #[test]
    fn test_bytes_and_slices() {
        let buf = AdjointBuffer::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2).unwrap();
        let back = AdjointBuffer::from_bytes(&buf.to_bytes(), 2).unwrap();
        assert_eq!(back, buf);

        let mut tail = buf.slice(1, 1).unwrap();
        assert_eq!(tail.as_slice(), &[3.0, 4.0]);
        tail.extend(&buf.slice(0, 1).unwrap());
        assert_eq!(tail.as_slice(), &[3.0, 4.0, 1.0, 2.0]);
        assert!(buf.slice(1, 2).is_err());
    }

    /// Minimal adjoint store for exercising the buffer without a sweep.
    struct TestStore {
        width: usize,
        vectors: std::collections::HashMap<TapeIndex, Vec<f64>>,
    }

    impl TestStore {
        fn new(width: usize) -> Self {
            Self {
                width,
                vectors: Default::default(),
            }
        }
    }

    impl AdjointInterface for TestStore {
        fn vector_width(&self) -> usize {
            self.width
        }

        fn get_adjoint_vec(&self, index: TapeIndex, out: &mut [f64]) {
            match self.vectors.get(&index) {
                Some(v) => out.copy_from_slice(v),
                None => out.fill(0.0),
            }
        }

        fn reset_adjoint_vec(&mut self, index: TapeIndex) {
            self.vectors.remove(&index);
        }

        fn update_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]) {
            if index.is_active() {
                let width = self.width;
                let v = self.vectors.entry(index).or_insert_with(|| vec![0.0; width]);
                v.iter_mut().zip(input).for_each(|(a, b)| *a += b);
            }
        }

        fn set_adjoint_vec(&mut self, index: TapeIndex, input: &[f64]) {
            if index.is_active() {
                self.vectors.insert(index, input.to_vec());
            }
        }

        fn reset_primal(&mut self, _index: TapeIndex, _value: f64) {}
    }
}
