//! Key-to-partition mapping.

use mdn_common::ids::KVS_PARTITIONS;

/// Maps `(table, key)` to a partition index.
///
/// The index is the big-endian 16-bit prefix of the key, zero-padded for
/// short keys. The function is a stable deterministic hash in the wire
/// contract sense: TxMan routing and KVS replication both call it, so any
/// replacement must roll out to every daemon at once.
#[must_use]
pub fn choose_index(_table: &[u8], key: &[u8]) -> u16 {
    let mut prefix = [0_u8; 2];
    let take = key.len().min(2);
    prefix[..take].copy_from_slice(&key[..take]);
    u16::from_be_bytes(prefix)
}

/// Whether an index addresses a real partition slot.
#[must_use]
pub fn index_in_range(index: u16) -> bool {
    usize::from(index) < KVS_PARTITIONS
}

#[cfg(test)]
mod tests {
    use super::{choose_index, index_in_range};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"".as_slice(), 0x0000)]
    #[case(b"k".as_slice(), 0x6b00)]
    #[case(b"ka".as_slice(), 0x6b61)]
    #[case(b"kab".as_slice(), 0x6b61)]
    fn index_is_the_big_endian_key_prefix(#[case] key: &[u8], #[case] expected: u16) {
        assert_that!(choose_index(b"table", key), eq(expected));
    }

    #[rstest]
    fn index_ignores_the_table() {
        assert_that!(
            choose_index(b"a", b"key"),
            eq(choose_index(b"b", b"key"))
        );
    }

    #[rstest]
    fn every_index_is_in_range() {
        assert_that!(index_in_range(0), eq(true));
        assert_that!(index_in_range(u16::MAX), eq(true));
    }
}
