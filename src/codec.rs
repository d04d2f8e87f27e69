//! codec — сериализация объектов в payload страниц данных.
//!
//! Формат образа (LE):
//!   [class_id u32][schema_ver u16][nfields u16] затем nfields tagged-значений.
//! Значение: [tag u8] + полезная нагрузка.
//!
//! Ссылки (Ref) кодируются голым OID и НИКОГДА не рекурсируются: кодек
//! работает строго с одним объектом, поэтому циклы в графе объектов не
//! приводят к зацикливанию. Поле, отсутствующее в старой версии схемы,
//! читается как Null на стороне сессии.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{ObexError, Result};
use crate::schema::{FieldDef, FieldKind};
use crate::types::Oid;

const VTAG_NULL: u8 = 0;
const VTAG_BOOL: u8 = 1;
const VTAG_I64: u8 = 2;
const VTAG_F64: u8 = 3;
const VTAG_STR: u8 = 4;
const VTAG_BYTES: u8 = 5;
const VTAG_REF: u8 = 6;
const VTAG_LIST: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ref(Oid),
    List(Vec<Value>),
}

impl Value {
    /// Совместимо ли значение с объявленным типом поля. Null допустим везде.
    pub fn matches(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Bool(_), FieldKind::Bool)
                | (Value::I64(_), FieldKind::I64)
                | (Value::F64(_), FieldKind::F64)
                | (Value::Str(_), FieldKind::Str)
                | (Value::Bytes(_), FieldKind::Bytes)
                | (Value::Ref(_), FieldKind::Ref)
                | (Value::List(_), FieldKind::List)
        )
    }
}

/// Декодированный образ объекта: значения в порядке полей дескриптора
/// версии schema_ver.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectImage {
    pub class_id: u32,
    pub schema_ver: u16,
    pub values: Vec<Value>,
}

fn write_value(out: &mut Vec<u8>, v: &Value) -> Result<()> {
    match v {
        Value::Null => out.write_u8(VTAG_NULL)?,
        Value::Bool(b) => {
            out.write_u8(VTAG_BOOL)?;
            out.write_u8(*b as u8)?;
        }
        Value::I64(x) => {
            out.write_u8(VTAG_I64)?;
            out.write_i64::<LittleEndian>(*x)?;
        }
        Value::F64(x) => {
            out.write_u8(VTAG_F64)?;
            out.write_u64::<LittleEndian>(x.to_bits())?;
        }
        Value::Str(s) => {
            out.write_u8(VTAG_STR)?;
            out.write_u32::<LittleEndian>(s.len() as u32)?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.write_u8(VTAG_BYTES)?;
            out.write_u32::<LittleEndian>(b.len() as u32)?;
            out.extend_from_slice(b);
        }
        Value::Ref(oid) => {
            out.write_u8(VTAG_REF)?;
            out.write_u64::<LittleEndian>(*oid)?;
        }
        Value::List(items) => {
            out.write_u8(VTAG_LIST)?;
            out.write_u32::<LittleEndian>(items.len() as u32)?;
            for it in items {
                write_value(out, it)?;
            }
        }
    }
    Ok(())
}

fn read_value(cur: &mut Cursor<&[u8]>, depth: u32) -> Result<Value> {
    if depth > 32 {
        return Err(ObexError::corruption("value nesting too deep"));
    }
    let tag = cur.read_u8()?;
    Ok(match tag {
        VTAG_NULL => Value::Null,
        VTAG_BOOL => Value::Bool(cur.read_u8()? != 0),
        VTAG_I64 => Value::I64(cur.read_i64::<LittleEndian>()?),
        VTAG_F64 => Value::F64(f64::from_bits(cur.read_u64::<LittleEndian>()?)),
        VTAG_STR => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut b = vec![0u8; len];
            std::io::Read::read_exact(cur, &mut b)?;
            Value::Str(String::from_utf8(b).map_err(|_| {
                ObexError::corruption("object image: invalid utf-8 in string field")
            })?)
        }
        VTAG_BYTES => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut b = vec![0u8; len];
            std::io::Read::read_exact(cur, &mut b)?;
            Value::Bytes(b)
        }
        VTAG_REF => Value::Ref(cur.read_u64::<LittleEndian>()?),
        VTAG_LIST => {
            let n = cur.read_u32::<LittleEndian>()? as usize;
            if n > 1_000_000 {
                return Err(ObexError::corruption("object image: absurd list length"));
            }
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_value(cur, depth + 1)?);
            }
            Value::List(items)
        }
        other => {
            return Err(ObexError::corruption(format!(
                "object image: unknown value tag {}",
                other
            )))
        }
    })
}

/// Кодирование: values в порядке fields; типы проверяются против схемы.
pub fn encode_object(
    class_id: u32,
    schema_ver: u16,
    fields: &[FieldDef],
    values: &[Value],
) -> Result<Vec<u8>> {
    if fields.len() != values.len() {
        return Err(ObexError::usage(format!(
            "field count mismatch: schema has {}, got {}",
            fields.len(),
            values.len()
        )));
    }
    let mut out = Vec::with_capacity(16 + values.len() * 12);
    out.write_u32::<LittleEndian>(class_id)?;
    out.write_u16::<LittleEndian>(schema_ver)?;
    out.write_u16::<LittleEndian>(values.len() as u16)?;
    for (fd, v) in fields.iter().zip(values) {
        if !v.matches(fd.kind) {
            return Err(ObexError::usage(format!(
                "field {}: value does not match declared type {:?}",
                fd.name, fd.kind
            )));
        }
        write_value(&mut out, v)?;
    }
    Ok(out)
}

pub fn decode_object(payload: &[u8]) -> Result<ObjectImage> {
    let mut cur = Cursor::new(payload);
    let class_id = cur.read_u32::<LittleEndian>()?;
    let schema_ver = cur.read_u16::<LittleEndian>()?;
    let n = cur.read_u16::<LittleEndian>()? as usize;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(read_value(&mut cur, 0)?);
    }
    Ok(ObjectImage {
        class_id,
        schema_ver,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_kinds() {
        let fields = vec![
            FieldDef::new("b", FieldKind::Bool),
            FieldDef::new("i", FieldKind::I64),
            FieldDef::new("f", FieldKind::F64),
            FieldDef::new("s", FieldKind::Str),
            FieldDef::new("raw", FieldKind::Bytes),
            FieldDef::new("next", FieldKind::Ref),
            FieldDef::new("tags", FieldKind::List),
            FieldDef::new("opt", FieldKind::I64),
        ];
        let vals = vec![
            Value::Bool(true),
            Value::I64(-42),
            Value::F64(3.5),
            Value::Str("привет".into()),
            Value::Bytes(vec![0, 255, 7]),
            Value::Ref(99),
            Value::List(vec![Value::I64(1), Value::Str("x".into())]),
            Value::Null,
        ];
        let buf = encode_object(7, 2, &fields, &vals).unwrap();
        let img = decode_object(&buf).unwrap();
        assert_eq!(img.class_id, 7);
        assert_eq!(img.schema_ver, 2);
        assert_eq!(img.values, vals);
    }

    #[test]
    fn self_reference_stays_flat() {
        // Ссылка объекта на самого себя кодируется как OID, без рекурсии.
        let fields = vec![FieldDef::new("me", FieldKind::Ref)];
        let buf = encode_object(1, 0, &fields, &[Value::Ref(5)]).unwrap();
        let img = decode_object(&buf).unwrap();
        assert_eq!(img.values, vec![Value::Ref(5)]);
        // Размер фиксированный: хедер 8 + tag 1 + oid 8.
        assert_eq!(buf.len(), 17);
    }

    #[test]
    fn type_mismatch_rejected() {
        let fields = vec![FieldDef::new("i", FieldKind::I64)];
        let err = encode_object(1, 0, &fields, &[Value::Str("no".into())]).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn garbage_tag_is_corruption() {
        let fields = vec![FieldDef::new("i", FieldKind::I64)];
        let mut buf = encode_object(1, 0, &fields, &[Value::I64(1)]).unwrap();
        buf[8] = 200; // value tag
        assert!(decode_object(&buf).is_err());
    }
}
