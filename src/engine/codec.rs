//! Row and value codec
//!
//! Rows are serialized with the same conventions as every other on-disk
//! structure in the engine: little-endian fixed-width integers and
//! length-prefixed variable fields.
//!
//! ```text
//! Row:   [rowid i64 LE][value count u16 LE][values...]
//! Value: [tag u8][payload]
//!   0 Null     (no payload)
//!   1 Integer  (i64 LE)
//!   2 Real     (f64 LE bits)
//!   3 Text     (u32 LE length + UTF-8 bytes)
//!   4 Blob     (u32 LE length + bytes)
//! ```

use super::errors::{EngineError, EngineResult};

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) => 1,
            Value::Real(_) => 2,
            Value::Text(_) => 3,
            Value::Blob(_) => 4,
        }
    }
}

/// A table row: explicit rowid plus ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub rowid: i64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(rowid: i64, values: Vec<Value>) -> Self {
        Row { rowid, values }
    }
}

/// Sequential reader over a byte slice with explicit truncation errors
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(EngineError::InvalidFormat(format!(
                "truncated: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> EngineResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> EngineResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> EngineResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> EngineResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_i64(&mut self) -> EngineResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> EngineResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a u32 length prefix followed by that many bytes
    pub fn read_bytes(&mut self) -> EngineResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> EngineResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::InvalidFormat(format!("invalid UTF-8: {}", e)))
    }
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    buf.push(value.tag());
    match value {
        Value::Null => {}
        Value::Integer(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Real(r) => buf.extend_from_slice(&r.to_bits().to_le_bytes()),
        Value::Text(s) => write_string(buf, s),
        Value::Blob(b) => write_bytes(buf, b),
    }
}

fn decode_value(reader: &mut ByteReader<'_>) -> EngineResult<Value> {
    match reader.read_u8()? {
        0 => Ok(Value::Null),
        1 => Ok(Value::Integer(reader.read_i64()?)),
        2 => Ok(Value::Real(reader.read_f64()?)),
        3 => Ok(Value::Text(reader.read_string()?)),
        4 => Ok(Value::Blob(reader.read_bytes()?.to_vec())),
        tag => Err(EngineError::InvalidFormat(format!(
            "unknown value tag: {}",
            tag
        ))),
    }
}

/// Append the serialized form of `row` to `buf`
pub fn encode_row(row: &Row, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&row.rowid.to_le_bytes());
    buf.extend_from_slice(&(row.values.len() as u16).to_le_bytes());
    for value in &row.values {
        encode_value(value, buf);
    }
}

/// Serialized length of `row`
pub fn encoded_row_len(row: &Row) -> usize {
    let mut buf = Vec::new();
    encode_row(row, &mut buf);
    buf.len()
}

/// Decode one row from the reader's current position
pub(crate) fn decode_row(reader: &mut ByteReader<'_>) -> EngineResult<Row> {
    let rowid = reader.read_i64()?;
    let count = reader.read_u16()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(reader)?);
    }
    Ok(Row { rowid, values })
}
