//! page/root — корневой каталог стора (PAGE_TYPE_ROOT_CATALOG).
//!
//! Каталог описывает всё состояние одной опубликованной версии:
//! - корень первичного индекса (OID -> расположение записи) и его epoch;
//! - дескрипторы полевых индексов: имя ("Class.field"), уникальность,
//!   корневая страница, epoch (версия последнего изменившего коммита);
//! - live-счётчики страниц данных (сколько актуальных записей осталось на
//!   каждой OBJECT_DATA странице; 0 => страница освобождается коммитом).
//!
//! Байтовая кодировка (LE), с crc32 в конце:
//!   [primary_root u64][primary_epoch u64]
//!   [index_count u32] затем для каждого:
//!     [name_len u16][name utf8][unique u8][root u64][epoch u64]
//!   [data_page_count u32] затем [page_id u64][live u32] ...
//!   [crc32 u32]
//!
//! Каталог может не поместиться на одну страницу, поэтому хранится цепочкой
//! ROOT_CATALOG страниц: тело каждой — [next u64][chunk_len u32][chunk].

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Read;

use crate::errors::{ObexError, Result};
use crate::types::{PageId, VersionId, NO_PAGE};

use super::common::{
    page_body_capacity, page_expect_type, page_init_header, PAGE_HDR_SIZE,
    PAGE_TYPE_ROOT_CATALOG, TRAILER_LEN,
};

/// Дескриптор полевого индекса в каталоге.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// "Class.field"
    pub name: String,
    pub unique: bool,
    pub root: PageId,
    /// Версия последнего коммита, изменившего этот индекс.
    pub epoch: VersionId,
}

/// Корневой каталог одной опубликованной версии.
#[derive(Debug, Clone)]
pub struct RootCatalog {
    pub primary_root: PageId,
    pub primary_epoch: VersionId,
    pub indexes: Vec<IndexDef>,
    /// page_id страницы данных -> число живых записей на ней.
    pub data_live: BTreeMap<PageId, u32>,
}

impl RootCatalog {
    pub fn empty() -> Self {
        Self {
            primary_root: NO_PAGE,
            primary_epoch: 0,
            indexes: Vec::new(),
            data_live: BTreeMap::new(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|d| d.name == name)
    }

    /// Сериализация каталога в байты (c crc32 в конце).
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(self.primary_root).unwrap();
        out.write_u64::<LittleEndian>(self.primary_epoch).unwrap();
        out.write_u32::<LittleEndian>(self.indexes.len() as u32)
            .unwrap();
        for d in &self.indexes {
            out.write_u16::<LittleEndian>(d.name.len() as u16).unwrap();
            out.extend_from_slice(d.name.as_bytes());
            out.write_u8(u8::from(d.unique)).unwrap();
            out.write_u64::<LittleEndian>(d.root).unwrap();
            out.write_u64::<LittleEndian>(d.epoch).unwrap();
        }
        out.write_u32::<LittleEndian>(self.data_live.len() as u32)
            .unwrap();
        for (pid, live) in &self.data_live {
            out.write_u64::<LittleEndian>(*pid).unwrap();
            out.write_u32::<LittleEndian>(*live).unwrap();
        }
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc).unwrap();
        out
    }

    pub fn decode_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(ObexError::corruption("root catalog too short"));
        }
        let (payload, tail) = raw.split_at(raw.len() - 4);
        let stored_crc = LittleEndian::read_u32(tail);
        let calc = crc32fast::hash(payload);
        if stored_crc != calc {
            return Err(ObexError::corruption(format!(
                "root catalog CRC mismatch (stored={:#010x}, calc={:#010x})",
                stored_crc, calc
            )));
        }

        let mut r = payload;
        let corrupt = || ObexError::corruption("truncated root catalog");
        let primary_root = r.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
        let primary_epoch = r.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
        let index_count = r.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let name_len = r.read_u16::<LittleEndian>().map_err(|_| corrupt())? as usize;
            let mut name_raw = vec![0u8; name_len];
            r.read_exact(&mut name_raw).map_err(|_| corrupt())?;
            let name = String::from_utf8(name_raw)
                .map_err(|_| ObexError::corruption("non-utf8 index name in root catalog"))?;
            let unique = r.read_u8().map_err(|_| corrupt())? != 0;
            let root = r.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
            let epoch = r.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
            indexes.push(IndexDef {
                name,
                unique,
                root,
                epoch,
            });
        }
        let data_count = r.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
        let mut data_live = BTreeMap::new();
        for _ in 0..data_count {
            let pid = r.read_u64::<LittleEndian>().map_err(|_| corrupt())?;
            let live = r.read_u32::<LittleEndian>().map_err(|_| corrupt())?;
            data_live.insert(pid, live);
        }
        Ok(Self {
            primary_root,
            primary_epoch,
            indexes,
            data_live,
        })
    }
}

// ---------- Цепочка ROOT_CATALOG страниц ----------

/// Сколько байт каталога помещается на одну страницу цепочки.
#[inline]
pub fn chain_chunk_capacity(page_size: usize) -> usize {
    page_body_capacity(page_size) - 8 - 4
}

/// Закодировать одну страницу цепочки каталога.
pub fn encode_chain_page(
    page_id: PageId,
    next: PageId,
    chunk: &[u8],
    page_size: usize,
) -> Result<Vec<u8>> {
    if chunk.len() > chain_chunk_capacity(page_size) {
        return Err(ObexError::corruption(format!(
            "root catalog chunk overflows page {} ({} bytes)",
            page_id,
            chunk.len()
        )));
    }
    let mut buf = vec![0u8; page_size];
    page_init_header(&mut buf, PAGE_TYPE_ROOT_CATALOG, page_id);
    let mut off = PAGE_HDR_SIZE;
    LittleEndian::write_u64(&mut buf[off..off + 8], next);
    off += 8;
    LittleEndian::write_u32(&mut buf[off..off + 4], chunk.len() as u32);
    off += 4;
    buf[off..off + chunk.len()].copy_from_slice(chunk);
    Ok(buf)
}

/// Декодировать страницу цепочки: (next_page, chunk).
pub fn decode_chain_page(buf: &[u8], page_id: PageId) -> Result<(PageId, Vec<u8>)> {
    page_expect_type(buf, page_id, PAGE_TYPE_ROOT_CATALOG)?;
    let limit = buf.len() - TRAILER_LEN;
    let mut off = PAGE_HDR_SIZE;
    if off + 12 > limit {
        return Err(ObexError::corruption(format!(
            "truncated root catalog page {}",
            page_id
        )));
    }
    let next = LittleEndian::read_u64(&buf[off..off + 8]);
    off += 8;
    let len = LittleEndian::read_u32(&buf[off..off + 4]) as usize;
    off += 4;
    if off + len > limit {
        return Err(ObexError::corruption(format!(
            "root catalog chunk overflows page {}",
            page_id
        )));
    }
    Ok((next, buf[off..off + len].to_vec()))
}
