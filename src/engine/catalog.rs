//! Table catalog
//!
//! The catalog names every table, its ordered columns, and its
//! auto-increment sequence (`next_rowid`). It is serialized as JSON onto
//! catalog pages. The sequence lives here rather than with the rows so a
//! deposit can empty a table while the sequence keeps counting.

use serde::{Deserialize, Serialize};

use super::errors::{EngineError, EngineResult};

/// Schema and sequence state of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: u32,
    pub name: String,
    pub columns: Vec<String>,
    /// Next rowid the sequence will hand out; strictly increasing for the
    /// lifetime of the table, including across truncation
    pub next_rowid: i64,
}

/// The full table catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: Vec<TableSchema>,
    next_table_id: u32,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            tables: Vec::new(),
            next_table_id: 1,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableSchema> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub fn table_by_id(&self, id: u32) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.id == id)
    }

    /// Register a new table; rejects duplicates
    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<String>,
        next_rowid: i64,
    ) -> EngineResult<u32> {
        if self.table(name).is_some() {
            return Err(EngineError::SchemaMismatch {
                table: name.to_string(),
                detail: "table already exists".to_string(),
            });
        }
        let id = self.next_table_id;
        self.next_table_id += 1;
        self.tables.push(TableSchema {
            id,
            name: name.to_string(),
            columns,
            next_rowid,
        });
        Ok(id)
    }

    pub fn to_json(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::InvalidFormat(format!("catalog serialization: {}", e)))
    }

    pub fn from_json(data: &[u8]) -> EngineResult<Catalog> {
        serde_json::from_slice(data)
            .map_err(|e| EngineError::InvalidFormat(format!("catalog parse: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_and_lookup() {
        let mut catalog = Catalog::new();
        let id = catalog
            .create_table("objects", cols(&["id", "name"]), 1)
            .unwrap();

        let table = catalog.table("objects").unwrap();
        assert_eq!(table.id, id);
        assert_eq!(table.columns, cols(&["id", "name"]));
        assert_eq!(table.next_rowid, 1);
        assert_eq!(catalog.table_by_id(id).unwrap().name, "objects");
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut catalog = Catalog::new();
        catalog.create_table("objects", cols(&["a"]), 1).unwrap();
        let err = catalog.create_table("objects", cols(&["a"]), 1).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_ids_are_distinct() {
        let mut catalog = Catalog::new();
        let a = catalog.create_table("a", cols(&["x"]), 1).unwrap();
        let b = catalog.create_table("b", cols(&["x"]), 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut catalog = Catalog::new();
        catalog.create_table("objects", cols(&["id", "name"]), 5).unwrap();
        catalog.create_table("events", cols(&["ts"]), 12).unwrap();

        let json = catalog.to_json().unwrap();
        let decoded = Catalog::from_json(&json).unwrap();
        assert_eq!(decoded, catalog);
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(Catalog::from_json(b"not json").is_err());
    }
}
