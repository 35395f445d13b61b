//! ## [Permutative Encoding](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5faf4800-645d-49d1-9457-2ac40eb467bd)
//!
//! Applied to external data blocks when the header selects
//! [`NdbCryptMethod::Permute`](crate::ndb::header::NdbCryptMethod::Permute).
//! Extended and subnode blocks are never encoded.

use super::*;

/// Encode external block data in place.
pub fn encode_block(data: &mut [u8]) {
    substitute(data, key_data_r());
}

/// Decode external block data in place.
pub fn decode_block(data: &mut [u8]) {
    substitute(data, key_data_i());
}

fn substitute(data: &mut [u8], table: &[u8; 256]) {
    for b in data.iter_mut() {
        *b = table[*b as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Hello, World!";

    #[test]
    fn test_encode_changes_data() {
        let mut data = SAMPLE.to_vec();
        encode_block(&mut data);
        assert_ne!(SAMPLE, &data);
    }

    #[test]
    fn test_round_trip() {
        let mut data = SAMPLE.to_vec();
        encode_block(&mut data);
        decode_block(&mut data);
        assert_eq!(SAMPLE, &data);
    }

    #[test]
    fn test_round_trip_all_bytes() {
        let mut data: Vec<u8> = (0..=255).collect();
        encode_block(&mut data);
        decode_block(&mut data);
        assert_eq!(data, (0..=255).collect::<Vec<u8>>());
    }
}
