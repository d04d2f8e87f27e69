//! index/key — ключи индексов и их порядко-сохраняющая байтовая кодировка.
//!
//! Все сравнения в B+Tree выполняются над закодированными байтами (memcmp),
//! поэтому кодировка обязана сохранять порядок исходных значений:
//! - i64: смещение знака (v ^ i64::MIN) и big-endian;
//! - f64: total order по битам (отрицательные — инверсия всех бит);
//! - строки/байты: как есть (лексикографический порядок);
//! - разные типы упорядочены байтом-тегом.
//!
//! Запись индекса — пара (key, oid); tie-break всегда по OID по возрастанию,
//! что даёт тотальный детерминированный порядок при равных ключах.

use std::cmp::Ordering;

use crate::codec::Value;
use crate::errors::{ObexError, Result};
use crate::types::Oid;

const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_OID: u8 = 6;

/// Значение ключа индекса.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Oid(Oid),
}

impl IndexKey {
    /// Порядко-сохраняющая кодировка (memcmp-совместимая).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IndexKey::Bool(b) => vec![TAG_BOOL, u8::from(*b)],
            IndexKey::I64(v) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_I64);
                out.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes());
                out
            }
            IndexKey::F64(v) => {
                let bits = v.to_bits();
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits ^ (1 << 63)
                };
                let mut out = Vec::with_capacity(9);
                out.push(TAG_F64);
                out.extend_from_slice(&ordered.to_be_bytes());
                out
            }
            IndexKey::Str(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(TAG_STR);
                out.extend_from_slice(s.as_bytes());
                out
            }
            IndexKey::Bytes(b) => {
                let mut out = Vec::with_capacity(1 + b.len());
                out.push(TAG_BYTES);
                out.extend_from_slice(b);
                out
            }
            IndexKey::Oid(o) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_OID);
                out.extend_from_slice(&o.to_be_bytes());
                out
            }
        }
    }

    /// Построить ключ из значения поля. Null и составные значения не индексируемы.
    pub fn from_value(v: &Value) -> Result<IndexKey> {
        match v {
            Value::Bool(b) => Ok(IndexKey::Bool(*b)),
            Value::I64(i) => Ok(IndexKey::I64(*i)),
            Value::F64(f) => Ok(IndexKey::F64(*f)),
            Value::Str(s) => Ok(IndexKey::Str(s.clone())),
            Value::Bytes(b) => Ok(IndexKey::Bytes(b.clone())),
            Value::Ref(o) => Ok(IndexKey::Oid(*o)),
            Value::Null => Err(ObexError::usage("null field value is not indexable")),
            Value::List(_) => Err(ObexError::usage("list field value is not indexable")),
        }
    }
}

/// Полный ключ записи индекса: (байты ключа, OID). Tie-break по OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    pub bytes: Vec<u8>,
    pub oid: Oid,
}

impl EntryKey {
    pub fn new(bytes: Vec<u8>, oid: Oid) -> Self {
        Self { bytes, oid }
    }

    /// Ключ первичного индекса: сам OID в big-endian.
    pub fn primary(oid: Oid) -> Self {
        Self {
            bytes: oid.to_be_bytes().to_vec(),
            oid,
        }
    }

    /// Минимальный ключ с данными байтами ключа (oid = 0): нижняя граница
    /// диапазона всех записей с этим значением ключа.
    pub fn lower_bound(bytes: Vec<u8>) -> Self {
        Self { bytes, oid: 0 }
    }

    /// Максимальный ключ с данными байтами ключа.
    pub fn upper_bound(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            oid: u64::MAX,
        }
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes
            .cmp(&other.bytes)
            .then(self.oid.cmp(&other.oid))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_encoding_preserves_order() {
        let vals = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        for w in vals.windows(2) {
            let a = IndexKey::I64(w[0]).encode();
            let b = IndexKey::I64(w[1]).encode();
            assert!(a < b, "{} !< {}", w[0], w[1]);
        }
    }

    #[test]
    fn f64_encoding_preserves_order() {
        let vals = [f64::NEG_INFINITY, -1.5, -0.0, 0.0, 1e-9, 3.25, f64::INFINITY];
        for w in vals.windows(2) {
            let a = IndexKey::F64(w[0]).encode();
            let b = IndexKey::F64(w[1]).encode();
            assert!(a <= b, "{} !<= {}", w[0], w[1]);
        }
    }

    #[test]
    fn entry_key_tie_breaks_by_oid() {
        let k = IndexKey::I64(7).encode();
        let a = EntryKey::new(k.clone(), 3);
        let b = EntryKey::new(k, 9);
        assert!(a < b);
        assert!(EntryKey::lower_bound(IndexKey::I64(7).encode()) <= a);
        assert!(EntryKey::upper_bound(IndexKey::I64(7).encode()) >= b);
    }
}
