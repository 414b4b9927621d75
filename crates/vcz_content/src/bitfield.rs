//! Wrapper types around Bitvec.
use bitvec::prelude::*;

use crate::error::Error;

/// Bitfield where index = chunk.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait VczBitfield {
    /// A zeroed bitfield with one bit per chunk.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Parse the payload of a "Bitfield" message for a torrent with `pieces`
    /// chunks.
    ///
    /// The payload must have exactly `ceil(pieces / 8)` bytes, and the spare
    /// bits at the end of the last byte must all be zero.
    fn from_wire(bytes: &[u8], pieces: usize) -> Result<Bitfield, Error> {
        let expected = pieces.div_ceil(8);

        if bytes.len() != expected {
            return Err(Error::BitfieldLength { expected, got: bytes.len() });
        }

        let mut bitfield = Bitfield::from_slice(bytes);

        if bitfield[pieces..].any() {
            return Err(Error::BitfieldSpareBits);
        }

        bitfield.truncate(pieces);
        Ok(bitfield)
    }
}

impl VczBitfield for Bitfield {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert!(bitfield.not_any());
    }

    #[test]
    fn from_wire() {
        // pieces 0, 1 and 7, then 8
        let bitfield =
            Bitfield::from_wire(&[0b1100_0001, 0b1000_0000], 9).unwrap();
        assert_eq!(bitfield.len(), 9);
        assert_eq!(bitfield.iter_ones().collect::<Vec<_>>(), vec![0, 1, 7, 8]);

        // byte aligned, no spare bits
        let bitfield = Bitfield::from_wire(&[0xff], 8).unwrap();
        assert!(bitfield.all());
    }

    #[test]
    fn from_wire_wrong_len() {
        let r = Bitfield::from_wire(&[0, 0, 0], 9);
        assert!(matches!(
            r,
            Err(Error::BitfieldLength { expected: 2, got: 3 })
        ));

        let r = Bitfield::from_wire(&[], 1);
        assert!(matches!(
            r,
            Err(Error::BitfieldLength { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn from_wire_spare_bits() {
        let r = Bitfield::from_wire(&[0xff, 0b1100_0000], 9);
        assert!(matches!(r, Err(Error::BitfieldSpareBits)));
    }
}
