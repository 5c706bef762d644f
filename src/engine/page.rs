//! On-disk page format
//!
//! The file is an array of fixed-size pages. Page 0 is the header; every
//! other page is a catalog or data page. Each page carries a trailing CRC32
//! so corruption is detected per page, never silently ignored.
//!
//! ```text
//! Header (page 0, always plaintext):
//!   [magic "DURA"][version u16][page_size u32][page_count u32]
//!   [encrypted u8][salt 16][verifier 32][pad u8][crc32 of bytes 0..64]
//!
//! Page (catalog or data):
//!   [kind u8][table_id u32][payload_len u32][payload][pad][crc32]
//! ```
//!
//! When a content key is set, whole pages (except the header) are XORed with
//! the keystream for their page number after the CRC is written; the CRC is
//! therefore only verifiable with the right key.

use crate::cipher::{SALT_LEN, VERIFIER_LEN};

use super::errors::{EngineError, EngineResult};

/// File magic for the main database file
pub const FILE_MAGIC: [u8; 4] = *b"DURA";

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 65536;

/// Fixed length of the encoded header fields, excluding its CRC
pub const HEADER_LEN: usize = 64;

/// Header fields plus CRC; a header is readable from this many bytes
pub const HEADER_TOTAL_LEN: usize = HEADER_LEN + 4;

/// Per-page overhead: kind + table_id + payload_len + trailing CRC
pub const PAGE_OVERHEAD: usize = 1 + 4 + 4 + 4;

/// Kind tag of a non-header page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Catalog JSON chunk
    Catalog,
    /// Rows of a single table
    Data,
}

impl PageKind {
    fn to_u8(self) -> u8 {
        match self {
            PageKind::Catalog => 1,
            PageKind::Data => 2,
        }
    }

    fn from_u8(v: u8) -> Option<PageKind> {
        match v {
            1 => Some(PageKind::Catalog),
            2 => Some(PageKind::Data),
            _ => None,
        }
    }
}

/// Usable payload bytes per page
pub fn page_capacity(page_size: usize) -> usize {
    page_size - PAGE_OVERHEAD
}

/// Decoded header page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub page_size: u32,
    pub page_count: u32,
    pub encrypted: bool,
    pub salt: [u8; SALT_LEN],
    pub verifier: [u8; VERIFIER_LEN],
}

impl Header {
    /// Encode into a full header page of `page_size` bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; self.page_size as usize];
        page[0..4].copy_from_slice(&FILE_MAGIC);
        page[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        page[6..10].copy_from_slice(&self.page_size.to_le_bytes());
        page[10..14].copy_from_slice(&self.page_count.to_le_bytes());
        page[14] = if self.encrypted { 1 } else { 0 };
        page[15..15 + SALT_LEN].copy_from_slice(&self.salt);
        page[31..31 + VERIFIER_LEN].copy_from_slice(&self.verifier);

        let crc = crc32fast::hash(&page[0..HEADER_LEN]);
        page[HEADER_LEN..HEADER_TOTAL_LEN].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// Decode from the first bytes of a file.
    ///
    /// Needs only `HEADER_TOTAL_LEN` bytes; the stored page size tells the
    /// caller how wide the rest of the pages are.
    pub fn decode(data: &[u8]) -> EngineResult<Header> {
        if data.len() < HEADER_TOTAL_LEN {
            return Err(EngineError::InvalidFormat(
                "file too short for header".to_string(),
            ));
        }
        if data[0..4] != FILE_MAGIC {
            return Err(EngineError::InvalidFormat("bad magic".to_string()));
        }

        let stored_crc = u32::from_le_bytes([
            data[HEADER_LEN],
            data[HEADER_LEN + 1],
            data[HEADER_LEN + 2],
            data[HEADER_LEN + 3],
        ]);
        if crc32fast::hash(&data[0..HEADER_LEN]) != stored_crc {
            return Err(EngineError::Corrupt { page: 0 });
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "unsupported format version: {}",
                version
            )));
        }

        let page_size = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&(page_size as usize)) {
            return Err(EngineError::InvalidFormat(format!(
                "page size out of range: {}",
                page_size
            )));
        }

        let page_count = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[15..15 + SALT_LEN]);
        let mut verifier = [0u8; VERIFIER_LEN];
        verifier.copy_from_slice(&data[31..31 + VERIFIER_LEN]);

        Ok(Header {
            page_size,
            page_count,
            encrypted: data[14] != 0,
            salt,
            verifier,
        })
    }
}

/// Encode a page; `payload` must fit within `page_capacity(page_size)`
pub fn encode_page(
    kind: PageKind,
    table_id: u32,
    payload: &[u8],
    page_size: usize,
) -> EngineResult<Vec<u8>> {
    if payload.len() > page_capacity(page_size) {
        return Err(EngineError::InvalidFormat(format!(
            "payload of {} bytes exceeds page capacity {}",
            payload.len(),
            page_capacity(page_size)
        )));
    }

    let mut page = vec![0u8; page_size];
    page[0] = kind.to_u8();
    page[1..5].copy_from_slice(&table_id.to_le_bytes());
    page[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    page[9..9 + payload.len()].copy_from_slice(payload);

    let crc = crc32fast::hash(&page[0..page_size - 4]);
    page[page_size - 4..].copy_from_slice(&crc.to_le_bytes());
    Ok(page)
}

/// Decode a page, verifying its CRC. `page_no` is only used for errors.
pub fn decode_page(page: &[u8], page_no: u32) -> EngineResult<(PageKind, u32, &[u8])> {
    let page_size = page.len();
    if page_size < PAGE_OVERHEAD {
        return Err(EngineError::Corrupt { page: page_no });
    }

    let stored_crc = u32::from_le_bytes([
        page[page_size - 4],
        page[page_size - 3],
        page[page_size - 2],
        page[page_size - 1],
    ]);
    if crc32fast::hash(&page[0..page_size - 4]) != stored_crc {
        return Err(EngineError::Corrupt { page: page_no });
    }

    let kind = PageKind::from_u8(page[0]).ok_or(EngineError::Corrupt { page: page_no })?;
    let table_id = u32::from_le_bytes([page[1], page[2], page[3], page[4]]);
    let payload_len = u32::from_le_bytes([page[5], page[6], page[7], page[8]]) as usize;
    if payload_len > page_capacity(page_size) {
        return Err(EngineError::Corrupt { page: page_no });
    }

    Ok((kind, table_id, &page[9..9 + payload_len]))
}
