//! Material file format
//!
//! A material is a self-contained recovery artifact: per backed-up table it
//! carries the schema, the sequence position and every row, so the table can
//! be reconstructed without the live file being healthy.
//!
//! ```text
//! [magic "DMAT"][version u16][flags u8][salt 16][verifier 32]
//! [generation u64][created_at_ms i64][body_len u32]
//! [body (encrypted when flags bit 0 is set)]
//! [crc32 over prelude + plaintext body]
//!
//! body: [table count u32] then per table:
//!   [name][column count u32][columns...][next_rowid i64]
//!   [row count u32][rows...]
//! ```
//!
//! The generation counter is the "most recent" marker for the dual-slot
//! rotation: a higher valid generation wins. Flag and key checks come before
//! the CRC so a wrong key reports `KeyMismatch`, not `Corrupt`.

use std::fs;
use std::path::Path;

use chrono::Utc;

use crate::cipher::{Cipher, CipherKey, SALT_LEN, VERIFIER_LEN};
use crate::engine::codec::{self, ByteReader};
use crate::engine::{Row, StoreSnapshot};
use crate::errors::{RepairError, RepairResult};

pub const MATERIAL_MAGIC: [u8; 4] = *b"DMAT";
pub const MATERIAL_VERSION: u16 = 1;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;
// magic + version + flags + salt + verifier + generation + created_at + body_len
const PRELUDE_LEN: usize = 4 + 2 + 1 + SALT_LEN + VERIFIER_LEN + 8 + 8 + 4;

/// One table's content inside a material
#[derive(Debug, Clone, PartialEq)]
pub struct TableMaterial {
    pub name: String,
    pub columns: Vec<String>,
    pub next_rowid: i64,
    pub rows: Vec<Row>,
}

/// A decoded material generation
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    /// Rotation counter; the slot holding the higher valid generation is
    /// the most recent one
    pub generation: u64,
    /// Creation time, epoch milliseconds
    pub created_at_ms: i64,
    pub tables: Vec<TableMaterial>,
}

impl Material {
    /// Build a material from a store snapshot, keeping tables the filter admits
    pub fn from_snapshot<F>(snapshot: &StoreSnapshot, generation: u64, mut admit: F) -> Material
    where
        F: FnMut(&str) -> bool,
    {
        let tables = snapshot
            .tables()
            .filter(|(schema, _)| admit(&schema.name))
            .map(|(schema, rows)| TableMaterial {
                name: schema.name.clone(),
                columns: schema.columns.clone(),
                next_rowid: schema.next_rowid,
                rows: rows.to_vec(),
            })
            .collect();

        Material {
            generation,
            created_at_ms: Utc::now().timestamp_millis(),
            tables,
        }
    }

    /// Total rows across all tables
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.tables.len() as u32).to_le_bytes());
        for table in &self.tables {
            codec::write_string(&mut body, &table.name);
            body.extend_from_slice(&(table.columns.len() as u32).to_le_bytes());
            for column in &table.columns {
                codec::write_string(&mut body, column);
            }
            body.extend_from_slice(&table.next_rowid.to_le_bytes());
            body.extend_from_slice(&(table.rows.len() as u32).to_le_bytes());
            for row in &table.rows {
                codec::encode_row(row, &mut body);
            }
        }
        body
    }

    fn decode_body(body: &[u8]) -> RepairResult<Vec<TableMaterial>> {
        let corrupt = |e: crate::engine::EngineError| RepairError::Corrupt(e.to_string());

        let mut reader = ByteReader::new(body);
        let table_count = reader.read_u32().map_err(corrupt)? as usize;
        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            let name = reader.read_string().map_err(corrupt)?;
            let column_count = reader.read_u32().map_err(corrupt)? as usize;
            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                columns.push(reader.read_string().map_err(corrupt)?);
            }
            let next_rowid = reader.read_i64().map_err(corrupt)?;
            let row_count = reader.read_u32().map_err(corrupt)? as usize;
            let mut rows = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                rows.push(codec::decode_row(&mut reader).map_err(corrupt)?);
            }
            tables.push(TableMaterial {
                name,
                columns,
                next_rowid,
                rows,
            });
        }
        if !reader.is_empty() {
            return Err(RepairError::Corrupt(
                "trailing bytes after last material table".to_string(),
            ));
        }
        Ok(tables)
    }

    /// Serialize, encrypting the body when a cipher is given
    pub fn encode(&self, cipher: Option<&Cipher>) -> Vec<u8> {
        let body = self.encode_body();

        let mut out = Vec::with_capacity(PRELUDE_LEN + body.len() + 4);
        out.extend_from_slice(&MATERIAL_MAGIC);
        out.extend_from_slice(&MATERIAL_VERSION.to_le_bytes());
        match cipher {
            Some(cipher) => {
                out.push(FLAG_ENCRYPTED);
                out.extend_from_slice(&cipher.salt());
                out.extend_from_slice(&cipher.verifier());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&[0u8; SALT_LEN]);
                out.extend_from_slice(&[0u8; VERIFIER_LEN]);
            }
        }
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.created_at_ms.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());

        // CRC covers the prelude and the plaintext body
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out);
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut payload = body;
        if let Some(cipher) = cipher {
            cipher.apply(0, &mut payload);
        }
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode and validate a serialized material.
    ///
    /// Validation order: structure, then key verifier, then CRC; a wrong key
    /// is therefore reported as `KeyMismatch`, never as plausible rows.
    pub fn decode(bytes: &[u8], key: Option<&CipherKey>) -> RepairResult<Material> {
        if bytes.len() < PRELUDE_LEN + 4 {
            return Err(RepairError::Corrupt("material too short".to_string()));
        }
        if bytes[0..4] != MATERIAL_MAGIC {
            return Err(RepairError::Corrupt("bad material magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != MATERIAL_VERSION {
            return Err(RepairError::Corrupt(format!(
                "unsupported material version: {}",
                version
            )));
        }

        let encrypted = bytes[6] & FLAG_ENCRYPTED != 0;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[7..7 + SALT_LEN]);
        let mut verifier = [0u8; VERIFIER_LEN];
        verifier.copy_from_slice(&bytes[23..23 + VERIFIER_LEN]);

        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(&bytes[55..63]);
        let generation = u64::from_le_bytes(fixed);
        fixed.copy_from_slice(&bytes[63..71]);
        let created_at_ms = i64::from_le_bytes(fixed);
        let body_len =
            u32::from_le_bytes([bytes[71], bytes[72], bytes[73], bytes[74]]) as usize;

        if bytes.len() != PRELUDE_LEN + body_len + 4 {
            return Err(RepairError::Corrupt(
                "material length does not match body length".to_string(),
            ));
        }

        let cipher = match (encrypted, key) {
            (true, Some(key)) => {
                let cipher = Cipher::new(key, salt);
                if !cipher.verify(&verifier) {
                    return Err(RepairError::KeyMismatch("material key".to_string()));
                }
                Some(cipher)
            }
            (true, None) => {
                return Err(RepairError::KeyMismatch(
                    "material is encrypted, no key given".to_string(),
                ))
            }
            (false, Some(_)) => {
                return Err(RepairError::KeyMismatch(
                    "material is not encrypted, key given".to_string(),
                ))
            }
            (false, None) => None,
        };

        let mut body = bytes[PRELUDE_LEN..PRELUDE_LEN + body_len].to_vec();
        if let Some(cipher) = &cipher {
            cipher.apply(0, &mut body);
        }

        let stored_crc = u32::from_le_bytes([
            bytes[bytes.len() - 4],
            bytes[bytes.len() - 3],
            bytes[bytes.len() - 2],
            bytes[bytes.len() - 1],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[0..PRELUDE_LEN]);
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            return Err(RepairError::Corrupt(
                "material checksum mismatch".to_string(),
            ));
        }

        Ok(Material {
            generation,
            created_at_ms,
            tables: Material::decode_body(&body)?,
        })
    }

    /// Read and validate a material file
    pub fn read_from(path: &Path, key: Option<&CipherKey>) -> RepairResult<Material> {
        let bytes = fs::read(path).map_err(|e| RepairError::io_at(path, e))?;
        Material::decode(&bytes, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::random_salt;
    use crate::engine::Value;

    fn sample_material() -> Material {
        Material {
            generation: 3,
            created_at_ms: 1_700_000_000_000,
            tables: vec![
                TableMaterial {
                    name: "objects".to_string(),
                    columns: vec!["name".to_string()],
                    next_rowid: 3,
                    rows: vec![
                        Row::new(1, vec![Value::Text("object1".into())]),
                        Row::new(2, vec![Value::Text("object2".into())]),
                    ],
                },
                TableMaterial {
                    name: "empty".to_string(),
                    columns: vec!["x".to_string()],
                    next_rowid: 1,
                    rows: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let material = sample_material();
        let bytes = material.encode(None);
        let decoded = Material::decode(&bytes, None).unwrap();
        assert_eq!(decoded, material);
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let key = CipherKey::new(b"backup key");
        let cipher = Cipher::new(&key, random_salt());

        let material = sample_material();
        let bytes = material.encode(Some(&cipher));
        let decoded = Material::decode(&bytes, Some(&key)).unwrap();
        assert_eq!(decoded, material);
    }

    #[test]
    fn test_wrong_key_is_key_mismatch_not_corrupt() {
        let key = CipherKey::new(b"backup key");
        let cipher = Cipher::new(&key, random_salt());
        let bytes = sample_material().encode(Some(&cipher));

        let wrong = CipherKey::new(b"other key");
        let err = Material::decode(&bytes, Some(&wrong)).unwrap_err();
        assert!(err.is_key_mismatch(), "got: {}", err);
    }

    #[test]
    fn test_missing_key_rejected() {
        let key = CipherKey::new(b"backup key");
        let cipher = Cipher::new(&key, random_salt());
        let bytes = sample_material().encode(Some(&cipher));
        assert!(Material::decode(&bytes, None).unwrap_err().is_key_mismatch());
    }

    #[test]
    fn test_flipped_byte_detected() {
        let mut bytes = sample_material().encode(None);
        let mid = PRELUDE_LEN + 5;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            Material::decode(&bytes, None),
            Err(RepairError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_file_detected() {
        let bytes = sample_material().encode(None);
        assert!(Material::decode(&bytes[..bytes.len() - 10], None).is_err());
    }

    #[test]
    fn test_row_count_sums_tables() {
        assert_eq!(sample_material().row_count(), 2);
    }
}
