//! Tolerant page scan of a damaged file
//!
//! Unlike the engine's strict open, this reader treats every page
//! independently: a page that fails its checksum or fails to parse is simply
//! reported as invalid, and the rest of the file is still read. Corruption
//! is the expected input here, not an error.

use std::fs;
use std::path::Path;

use crate::cipher::{Cipher, CipherKey};
use crate::engine::codec::Row;
use crate::engine::page::{self, Header, PageKind, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::engine::{decode_data_payload, Catalog, DEFAULT_PAGE_SIZE};

/// A damaged file loaded for best-effort reading
pub struct RawFile {
    bytes: Vec<u8>,
    page_size: usize,
    header: Option<Header>,
    cipher: Option<Cipher>,
}

impl RawFile {
    /// Load a file for scanning. Never fails: an unreadable file scans as
    /// zero pages. `fallback_page_size` is used when the header is too
    /// damaged to state the real one.
    pub fn load(path: &Path, fallback_page_size: usize, key: Option<&CipherKey>) -> RawFile {
        let bytes = fs::read(path).unwrap_or_default();
        let header = Header::decode(&bytes).ok();

        let page_size = match &header {
            Some(header) => header.page_size as usize,
            None if (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&fallback_page_size) => {
                fallback_page_size
            }
            None => DEFAULT_PAGE_SIZE,
        };

        let cipher = match (&header, key) {
            (Some(header), Some(key)) if header.encrypted => {
                let cipher = Cipher::new(key, header.salt);
                // Wrong content key: no page will validate, which is the
                // honest outcome for an undecryptable file
                cipher.verify(&header.verifier).then_some(cipher)
            }
            _ => None,
        };

        RawFile {
            bytes,
            page_size,
            header,
            cipher,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Page count implied by the file length; a trailing partial page
    /// counts as one (necessarily invalid) page
    pub fn total_pages(&self) -> usize {
        self.bytes.len().div_ceil(self.page_size)
    }

    /// Decode one non-header page; `None` when it fails validation
    pub fn read_page(&self, page_no: usize) -> Option<(PageKind, u32, Vec<u8>)> {
        let start = page_no.checked_mul(self.page_size)?;
        let end = start.checked_add(self.page_size)?;
        if page_no == 0 || end > self.bytes.len() {
            return None;
        }

        let mut page = self.bytes[start..end].to_vec();
        if let Some(cipher) = &self.cipher {
            cipher.apply(page_no as u64, &mut page);
        }
        let (kind, table_id, payload) = page::decode_page(&page, page_no as u32).ok()?;
        Some((kind, table_id, payload.to_vec()))
    }

    /// Decode one data page into rows; `None` for invalid or non-data pages
    pub fn read_data_page(&self, page_no: usize) -> Option<(u32, Vec<Row>)> {
        match self.read_page(page_no)? {
            (PageKind::Data, table_id, payload) => {
                Some((table_id, decode_data_payload(&payload).ok()?))
            }
            _ => None,
        }
    }
}

/// Attempt to read the catalog from whatever catalog pages survive.
///
/// Chunks are concatenated in page order; if any chunk is missing the JSON
/// will not parse and discovery reports no catalog rather than a wrong one.
pub fn discover_catalog(raw: &RawFile) -> Option<Catalog> {
    let mut json = Vec::new();
    let mut saw_chunk = false;
    for page_no in 1..raw.total_pages() {
        if let Some((PageKind::Catalog, _, payload)) = raw.read_page(page_no) {
            json.extend_from_slice(&payload);
            saw_chunk = true;
        }
    }
    if !saw_chunk {
        return None;
    }
    Catalog::from_json(&json).ok()
}
