//! page/data — страницы данных объектов (PAGE_TYPE_OBJECT_DATA).
//!
//! Тело: [count u16] затем count записей:
//!   [oid u64][version u64][len u32][payload]
//!
//! Страница данных пишется один раз (в рамках одного коммита) и далее
//! неизменяема; обновление объекта пишет новую запись на новую страницу,
//! старая запись становится мусором и учитывается в live-счётчике страницы
//! (root catalog). version — номер коммита, записавшего запись; именно он
//! сравнивается при оптимистической верификации.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{ObexError, Result};
use crate::types::{Oid, PageId, VersionId};

use super::common::{
    page_body_capacity, page_expect_type, page_init_header, PAGE_HDR_SIZE,
    PAGE_TYPE_OBJECT_DATA, TRAILER_LEN,
};

#[derive(Debug, Clone)]
pub struct DataRecord {
    pub oid: Oid,
    pub version: VersionId,
    pub payload: Vec<u8>,
}

impl DataRecord {
    #[inline]
    pub fn encoded_len(&self) -> usize {
        8 + 8 + 4 + self.payload.len()
    }
}

/// Максимальный payload одного объекта при данном размере страницы.
#[inline]
pub fn max_object_payload(page_size: usize) -> usize {
    page_body_capacity(page_size) - 2 - (8 + 8 + 4)
}

/// Закодировать страницу данных из набора записей.
pub fn encode_data_page(
    records: &[DataRecord],
    page_id: PageId,
    page_size: usize,
) -> Result<Vec<u8>> {
    let body = 2 + records.iter().map(|r| r.encoded_len()).sum::<usize>();
    if body > page_body_capacity(page_size) {
        return Err(ObexError::corruption(format!(
            "object records overflow data page {} ({} > {})",
            page_id,
            body,
            page_body_capacity(page_size)
        )));
    }

    let mut buf = vec![0u8; page_size];
    page_init_header(&mut buf, PAGE_TYPE_OBJECT_DATA, page_id);
    let mut off = PAGE_HDR_SIZE;
    LittleEndian::write_u16(&mut buf[off..off + 2], records.len() as u16);
    off += 2;
    for r in records {
        LittleEndian::write_u64(&mut buf[off..off + 8], r.oid);
        off += 8;
        LittleEndian::write_u64(&mut buf[off..off + 8], r.version);
        off += 8;
        LittleEndian::write_u32(&mut buf[off..off + 4], r.payload.len() as u32);
        off += 4;
        buf[off..off + r.payload.len()].copy_from_slice(&r.payload);
        off += r.payload.len();
    }
    Ok(buf)
}

/// Декодировать все записи страницы данных.
pub fn decode_data_page(buf: &[u8], page_id: PageId) -> Result<Vec<DataRecord>> {
    page_expect_type(buf, page_id, PAGE_TYPE_OBJECT_DATA)?;
    let limit = buf.len() - TRAILER_LEN;
    let corrupt =
        || ObexError::corruption(format!("truncated object record on data page {}", page_id));

    let mut off = PAGE_HDR_SIZE;
    if off + 2 > limit {
        return Err(corrupt());
    }
    let count = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
    off += 2;

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if off + 8 + 8 + 4 > limit {
            return Err(corrupt());
        }
        let oid = LittleEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let version = LittleEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let len = LittleEndian::read_u32(&buf[off..off + 4]) as usize;
        off += 4;
        if off + len > limit {
            return Err(corrupt());
        }
        out.push(DataRecord {
            oid,
            version,
            payload: buf[off..off + len].to_vec(),
        });
        off += len;
    }
    Ok(out)
}

/// Найти запись объекта на странице данных.
pub fn find_record(buf: &[u8], page_id: PageId, oid: Oid) -> Result<Option<DataRecord>> {
    let records = decode_data_page(buf, page_id)?;
    Ok(records.into_iter().find(|r| r.oid == oid))
}
