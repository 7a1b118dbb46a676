//! Log block codec.
//!
//! A log block is the fixed 512-byte unit of log file I/O: a 12-byte header,
//! an opaque payload, and a 4-byte checksum trailer. All functions here
//! operate in place on a byte slice whose first byte is the block start.

use ember_common::constants::{
    LOG_BLOCK_CHECKPOINT_NO, LOG_BLOCK_CHECKSUM, LOG_BLOCK_FIRST_REC_GROUP,
    LOG_BLOCK_FLUSH_BIT_MASK, LOG_BLOCK_HDR_DATA_LEN, LOG_BLOCK_HDR_NO,
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE,
};
use ember_common::Lsn;

use crate::checksum::ChecksumAlgorithm;
use crate::error::{RedoError, RedoResult};

#[inline]
fn get_u16_at(block: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([block[offset], block[offset + 1]])
}

#[inline]
fn put_u16_at(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn get_u32_at(block: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ])
}

#[inline]
fn put_u32_at(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Converts an LSN to the block number of the block containing it.
///
/// Block numbers cycle through `1..=2^31` and never use the value 0; the
/// high bit of the stored field is the flush flag.
#[must_use]
pub fn convert_lsn_to_no(lsn: Lsn) -> u32 {
    (1 + (lsn.as_u64() / LOG_BLOCK_SIZE as u64) % (1 << 31)) as u32
}

/// Initializes a block header for the block containing the given LSN.
///
/// Data length, first-record-group, and checkpoint number are zeroed; the
/// flush flag is clear.
pub fn init(block: &mut [u8], lsn: Lsn) {
    set_hdr_no(block, convert_lsn_to_no(lsn));
    set_data_len(block, LOG_BLOCK_HDR_SIZE);
    set_first_rec_group(block, 0);
    put_u32_at(block, LOG_BLOCK_CHECKPOINT_NO, 0);
}

/// Returns the block number, with the flush flag masked off.
#[must_use]
pub fn hdr_no(block: &[u8]) -> u32 {
    get_u32_at(block, LOG_BLOCK_HDR_NO) & !LOG_BLOCK_FLUSH_BIT_MASK
}

fn set_hdr_no(block: &mut [u8], no: u32) {
    // Clears the flush flag; it is stamped separately on the first block of
    // every write.
    put_u32_at(block, LOG_BLOCK_HDR_NO, no & !LOG_BLOCK_FLUSH_BIT_MASK);
}

/// Returns the flush flag of the block.
#[must_use]
pub fn flush_bit(block: &[u8]) -> bool {
    get_u32_at(block, LOG_BLOCK_HDR_NO) & LOG_BLOCK_FLUSH_BIT_MASK != 0
}

/// Sets or clears the flush flag.
///
/// The flag marks the first block of a physical write; recovery uses it to
/// tell where write boundaries were.
pub fn set_flush_bit(block: &mut [u8], value: bool) {
    let mut field = get_u32_at(block, LOG_BLOCK_HDR_NO);
    if value {
        field |= LOG_BLOCK_FLUSH_BIT_MASK;
    } else {
        field &= !LOG_BLOCK_FLUSH_BIT_MASK;
    }
    put_u32_at(block, LOG_BLOCK_HDR_NO, field);
}

/// Returns the number of bytes written to the block, header included.
///
/// A full block reads as `LOG_BLOCK_SIZE` even though the last 4 bytes are
/// the checksum trailer.
#[must_use]
pub fn data_len(block: &[u8]) -> usize {
    get_u16_at(block, LOG_BLOCK_HDR_DATA_LEN) as usize
}

/// Sets the data length field.
pub fn set_data_len(block: &mut [u8], len: usize) {
    debug_assert!(len <= LOG_BLOCK_SIZE);
    put_u16_at(block, LOG_BLOCK_HDR_DATA_LEN, len as u16);
}

/// Returns the offset of the first record group starting in this block, or
/// 0 if no record group starts here.
#[must_use]
pub fn first_rec_group(block: &[u8]) -> usize {
    get_u16_at(block, LOG_BLOCK_FIRST_REC_GROUP) as usize
}

/// Sets the first-record-group offset.
pub fn set_first_rec_group(block: &mut [u8], offset: usize) {
    debug_assert!(offset < LOG_BLOCK_SIZE);
    put_u16_at(block, LOG_BLOCK_FIRST_REC_GROUP, offset as u16);
}

/// Returns the low 32 bits of the checkpoint number stamped on the block.
#[must_use]
pub fn checkpoint_no(block: &[u8]) -> u32 {
    get_u32_at(block, LOG_BLOCK_CHECKPOINT_NO)
}

/// Stamps the checkpoint number that was current when the block was written.
pub fn set_checkpoint_no(block: &mut [u8], no: u64) {
    put_u32_at(block, LOG_BLOCK_CHECKPOINT_NO, (no & 0xFFFF_FFFF) as u32);
}

/// Returns the checksum stored in the block trailer.
#[must_use]
pub fn stored_checksum(block: &[u8]) -> u32 {
    get_u32_at(block, LOG_BLOCK_CHECKSUM)
}

/// Computes and stores the trailer checksum over the block's first
/// `LOG_BLOCK_SIZE - 4` bytes.
pub fn store_checksum(block: &mut [u8], algorithm: ChecksumAlgorithm) {
    let checksum = algorithm.compute(&block[..LOG_BLOCK_CHECKSUM]);
    put_u32_at(block, LOG_BLOCK_CHECKSUM, checksum);
}

/// Verifies the trailer checksum, returning a corruption error on mismatch.
pub fn verify_checksum(block: &[u8], algorithm: ChecksumAlgorithm) -> RedoResult<()> {
    let stored = stored_checksum(block);
    let computed = algorithm.compute(&block[..LOG_BLOCK_CHECKSUM]);
    if stored != computed {
        return Err(RedoError::BlockChecksumMismatch {
            block_no: hdr_no(block),
            stored,
            computed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::constants::LOG_START_LSN;

    fn fresh_block(lsn: u64) -> Vec<u8> {
        let mut block = vec![0u8; LOG_BLOCK_SIZE];
        init(&mut block, Lsn::new(lsn));
        block
    }

    #[test]
    fn test_convert_lsn_to_no() {
        assert_eq!(convert_lsn_to_no(Lsn::new(0)), 1);
        assert_eq!(convert_lsn_to_no(Lsn::new(511)), 1);
        assert_eq!(convert_lsn_to_no(Lsn::new(512)), 2);
        assert_eq!(convert_lsn_to_no(Lsn::new(LOG_START_LSN)), 17);
        // Consecutive blocks have consecutive numbers.
        let a = convert_lsn_to_no(Lsn::new(1 << 20));
        let b = convert_lsn_to_no(Lsn::new((1 << 20) + 512));
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_init_state() {
        let block = fresh_block(LOG_START_LSN);
        assert_eq!(hdr_no(&block), 17);
        assert_eq!(data_len(&block), LOG_BLOCK_HDR_SIZE);
        assert_eq!(first_rec_group(&block), 0);
        assert_eq!(checkpoint_no(&block), 0);
        assert!(!flush_bit(&block));
    }

    #[test]
    fn test_field_roundtrips() {
        let mut block = fresh_block(8192);
        set_data_len(&mut block, 300);
        set_first_rec_group(&mut block, 44);
        set_checkpoint_no(&mut block, 0x1_2345_6789);

        assert_eq!(data_len(&block), 300);
        assert_eq!(first_rec_group(&block), 44);
        // Only the low 32 bits of the checkpoint number survive.
        assert_eq!(checkpoint_no(&block), 0x2345_6789);
    }

    #[test]
    fn test_flush_bit_does_not_disturb_number() {
        let mut block = fresh_block(8192);
        let no = hdr_no(&block);

        set_flush_bit(&mut block, true);
        assert!(flush_bit(&block));
        assert_eq!(hdr_no(&block), no);

        set_flush_bit(&mut block, false);
        assert!(!flush_bit(&block));
        assert_eq!(hdr_no(&block), no);
    }

    #[test]
    fn test_checksum_roundtrip() {
        for algorithm in [
            ChecksumAlgorithm::Fold,
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::None,
        ] {
            let mut block = fresh_block(8192);
            block[100] = 0xAB;
            store_checksum(&mut block, algorithm);
            assert!(verify_checksum(&block, algorithm).is_ok());
        }
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut block = fresh_block(8192);
        store_checksum(&mut block, ChecksumAlgorithm::Fold);
        block[200] ^= 0xFF;

        let err = verify_checksum(&block, ChecksumAlgorithm::Fold).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_checksum_ignores_trailer_itself() {
        let mut block = fresh_block(8192);
        store_checksum(&mut block, ChecksumAlgorithm::Fold);
        // Storing again over the already-stored trailer must be stable.
        let first = stored_checksum(&block);
        store_checksum(&mut block, ChecksumAlgorithm::Fold);
        assert_eq!(stored_checksum(&block), first);
    }
}
