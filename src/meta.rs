//! The dual meta page. Grounded on the teacher's `Idb::meta()` selection
//! logic (pick the valid record with the larger `tx_id`) and on
//! `original_source/db/meta.cpp`'s `Meta::Load` (CRC-checked, falls back
//! to the other slot on mismatch) and field layout discipline (CRC is
//! computed over every field but itself).

use crate::error::{Result, RoltError};
use crate::page::{PageId, TxId};

pub const SIGNATURE: u32 = 0x726f_6c74; // "rolt"
pub const MIN_VERSION: u32 = 1;

// Field order per spec.md §6, little-endian:
// sign, min_version, page_size, page_count, tx_id, user_root,
// free_list_root, pending_root, reserved(3*u32), crc32
const OFF_SIGN: usize = 0;
const OFF_MIN_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_PAGE_COUNT: usize = 12;
const OFF_TX_ID: usize = 16;
const OFF_USER_ROOT: usize = 24;
const OFF_FREE_LIST_ROOT: usize = 28;
const OFF_PENDING_ROOT: usize = 32;
const OFF_RESERVED: usize = 36;
const OFF_CRC32: usize = 48;
pub const META_RECORD_SIZE: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub sign: u32,
    pub min_version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub tx_id: TxId,
    pub user_root: PageId,
    pub free_list_root: PageId,
    pub pending_root: PageId,
    pub crc32: u32,
}

impl Meta {
    pub fn new(page_size: u32, page_count: u32, user_root: PageId, free_list_root: PageId) -> Self {
        let mut m = Self {
            sign: SIGNATURE,
            min_version: MIN_VERSION,
            page_size,
            page_count,
            tx_id: 0,
            user_root,
            free_list_root,
            pending_root: 0,
            crc32: 0,
        };
        m.update_crc();
        m
    }

    pub fn is_signature_valid(&self) -> bool {
        self.sign == SIGNATURE && self.min_version <= MIN_VERSION
    }

    pub fn compute_crc(&self) -> u32 {
        let mut buf = [0u8; META_RECORD_SIZE];
        self.encode_into(&mut buf);
        crc32c::crc32c(&buf[..OFF_CRC32])
    }

    pub fn update_crc(&mut self) {
        self.crc32 = self.compute_crc();
    }

    pub fn is_valid(&self) -> bool {
        self.is_signature_valid() && self.crc32 == self.compute_crc()
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[OFF_SIGN..OFF_SIGN + 4].copy_from_slice(&self.sign.to_le_bytes());
        buf[OFF_MIN_VERSION..OFF_MIN_VERSION + 4].copy_from_slice(&self.min_version.to_le_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&self.page_count.to_le_bytes());
        buf[OFF_TX_ID..OFF_TX_ID + 8].copy_from_slice(&self.tx_id.to_le_bytes());
        buf[OFF_USER_ROOT..OFF_USER_ROOT + 4].copy_from_slice(&self.user_root.to_le_bytes());
        buf[OFF_FREE_LIST_ROOT..OFF_FREE_LIST_ROOT + 4]
            .copy_from_slice(&self.free_list_root.to_le_bytes());
        buf[OFF_PENDING_ROOT..OFF_PENDING_ROOT + 4]
            .copy_from_slice(&self.pending_root.to_le_bytes());
        buf[OFF_RESERVED..OFF_RESERVED + 12].fill(0);
        buf[OFF_CRC32..OFF_CRC32 + 4].copy_from_slice(&self.crc32.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; META_RECORD_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_RECORD_SIZE {
            return Err(RoltError::Corruption("meta page too small".into()));
        }
        let sign = u32::from_le_bytes(buf[OFF_SIGN..OFF_SIGN + 4].try_into().unwrap());
        let min_version =
            u32::from_le_bytes(buf[OFF_MIN_VERSION..OFF_MIN_VERSION + 4].try_into().unwrap());
        let page_size =
            u32::from_le_bytes(buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap());
        let page_count =
            u32::from_le_bytes(buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].try_into().unwrap());
        let tx_id = u64::from_le_bytes(buf[OFF_TX_ID..OFF_TX_ID + 8].try_into().unwrap());
        let user_root =
            u32::from_le_bytes(buf[OFF_USER_ROOT..OFF_USER_ROOT + 4].try_into().unwrap());
        let free_list_root = u32::from_le_bytes(
            buf[OFF_FREE_LIST_ROOT..OFF_FREE_LIST_ROOT + 4]
                .try_into()
                .unwrap(),
        );
        let pending_root = u32::from_le_bytes(
            buf[OFF_PENDING_ROOT..OFF_PENDING_ROOT + 4]
                .try_into()
                .unwrap(),
        );
        let crc32 = u32::from_le_bytes(buf[OFF_CRC32..OFF_CRC32 + 4].try_into().unwrap());
        Ok(Self {
            sign,
            min_version,
            page_size,
            page_count,
            tx_id,
            user_root,
            free_list_root,
            pending_root,
            crc32,
        })
    }

    /// Selects the authoritative meta record out of the two candidates,
    /// per spec.md §3: the larger valid `tx_id` wins; if only one is
    /// valid it's adopted; if neither is valid, the file is rejected.
    pub fn select(meta0: Result<Meta>, meta1: Result<Meta>) -> Result<(Meta, u8)> {
        let meta0 = meta0.ok().filter(Meta::is_valid);
        let meta1 = meta1.ok().filter(Meta::is_valid);
        match (meta0, meta1) {
            (Some(m0), Some(m1)) => {
                if m0.tx_id >= m1.tx_id {
                    Ok((m0, 0))
                } else {
                    Ok((m1, 1))
                }
            }
            (Some(m0), None) => Ok((m0, 0)),
            (None, Some(m1)) => Ok((m1, 1)),
            (None, None) => Err(RoltError::Corruption(
                "neither meta page is valid".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_preserves_fields_and_crc() {
        let mut meta = Meta::new(4096, 4, 3, 2);
        meta.tx_id = 7;
        meta.update_crc();
        let decoded = Meta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.is_valid());
    }

    #[test]
    fn tampered_field_fails_crc_check() {
        let meta = Meta::new(4096, 4, 3, 2);
        let mut buf = meta.encode();
        buf[OFF_TX_ID] ^= 0xff;
        let decoded = Meta::decode(&buf).unwrap();
        assert!(!decoded.is_valid());
    }

    #[test]
    fn select_prefers_higher_tx_id_among_two_valid() {
        let mut m0 = Meta::new(4096, 4, 1, 1);
        m0.tx_id = 5;
        m0.update_crc();
        let mut m1 = Meta::new(4096, 4, 1, 1);
        m1.tx_id = 9;
        m1.update_crc();
        let (selected, slot) = Meta::select(Ok(m0), Ok(m1)).unwrap();
        assert_eq!(selected.tx_id, 9);
        assert_eq!(slot, 1);
    }

    #[test]
    fn select_falls_back_to_the_only_valid_slot() {
        let mut m0 = Meta::new(4096, 4, 1, 1);
        m0.update_crc();
        let corrupt = Err(RoltError::Corruption("bad".into()));
        let (selected, slot) = Meta::select(Ok(m0), corrupt).unwrap();
        assert_eq!(selected, m0);
        assert_eq!(slot, 0);
    }

    #[test]
    fn select_rejects_file_when_neither_slot_is_valid() {
        let bad = || Err(RoltError::Corruption("bad".into()));
        assert!(Meta::select(bad(), bad()).is_err());
    }
}
