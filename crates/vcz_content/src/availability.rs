//! How many connected peers have each chunk.
use crate::bitfield::Bitfield;

/// One counter per chunk, incremented and decremented in bulk from the
/// bitfields that peers announce.
///
/// Used by rarest-first selection: the lower the counter, the rarer the chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitfieldCounter {
    field: Vec<u16>,
}

impl BitfieldCounter {
    pub fn new(pieces: usize) -> Self {
        Self { field: vec![0; pieces] }
    }

    /// Reset to `pieces` zeroed counters, dropping the previous state.
    pub fn create(&mut self, pieces: usize) {
        self.field.clear();
        self.field.resize(pieces, 0);
    }

    pub fn field(&self) -> &[u16] {
        &self.field
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        self.field.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }

    /// Increment the counter of a single chunk and return the new value.
    pub fn inc_piece(&mut self, index: usize) -> u16 {
        let counter = &mut self.field[index];
        assert!(*counter < u16::MAX, "availability of {index} overflowed");
        *counter += 1;
        *counter
    }

    /// Decrement the counter of a single chunk and return the new value.
    pub fn dec_piece(&mut self, index: usize) -> u16 {
        let counter = &mut self.field[index];
        assert!(*counter > 0, "availability of {index} would go below zero");
        *counter -= 1;
        *counter
    }

    /// Increment the counter of every chunk set in `bitfield`.
    pub fn inc(&mut self, bitfield: &Bitfield) {
        self.assert_len(bitfield);
        for index in bitfield.iter_ones() {
            self.inc_piece(index);
        }
    }

    /// Decrement the counter of every chunk set in `bitfield`.
    pub fn dec(&mut self, bitfield: &Bitfield) {
        self.assert_len(bitfield);
        for index in bitfield.iter_ones() {
            self.dec_piece(index);
        }
    }

    /// Sort `candidates` from the rarest to the most common chunk. Ties keep
    /// the lower index first, so the order is reproducible.
    pub fn rarest(
        &self,
        candidates: impl IntoIterator<Item = usize>,
    ) -> Vec<usize> {
        let mut pieces: Vec<usize> = candidates.into_iter().collect();
        pieces.sort_unstable_by_key(|&i| (self.field[i], i));
        pieces
    }

    fn assert_len(&self, bitfield: &Bitfield) {
        assert_eq!(
            bitfield.len(),
            self.field.len(),
            "bitfield does not have one bit per counter"
        );
    }
}
