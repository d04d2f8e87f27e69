//! page/common — общий префикс заголовка страниц и типы страниц.
//!
//! Все страницы ObexDB неизменяемы после публикации корня (COW): модификация
//! всегда пишет в НОВЫЙ page_id и никогда не перезаписывает страницу,
//! достижимую из опубликованного корня.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{ObexError, Result};
use crate::types::PageId;

/// 4-байтовая магия страницы.
pub const PAGE_MAGIC: &[u8; 4] = b"OBXP";

/// Версия формата страниц.
pub const PAGE_VERSION: u16 = 1;

/// Лист COW B+Tree: отсортированные (key, oid, value) записи.
pub const PAGE_TYPE_INDEX_LEAF: u16 = 1;
/// Внутренняя страница B+Tree: разделители + ссылки на детей.
pub const PAGE_TYPE_INDEX_INNER: u16 = 2;
/// Страница данных объектов: сериализованные записи по OID.
pub const PAGE_TYPE_OBJECT_DATA: u16 = 3;
/// Корневой каталог: корни индексов + учёт страниц данных (может быть цепочкой).
pub const PAGE_TYPE_ROOT_CATALOG: u16 = 4;

/// Фиксированная длина трейлера checksum.
pub const TRAILER_LEN: usize = 16;

// ---------- Общие offsets ----------
/// Смещение MAGIC (4 байта).
pub const OFF_MAGIC: usize = 0;
/// Смещение version (u16).
pub const OFF_VERSION: usize = 4;
/// Смещение type (u16).
pub const OFF_TYPE: usize = 6;
/// Смещение page_id (u64).
pub const OFF_PAGE_ID: usize = 8;
/// Размер общего префикса.
pub const PAGE_HDR_SIZE: usize = 16;

/// Полезная ёмкость страницы между заголовком и трейлером.
#[inline]
pub fn page_body_capacity(page_size: usize) -> usize {
    page_size - PAGE_HDR_SIZE - TRAILER_LEN
}

/// Записать общий префикс заголовка в буфер страницы.
pub fn page_init_header(buf: &mut [u8], ptype: u16, page_id: PageId) {
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(PAGE_MAGIC);
    LittleEndian::write_u16(&mut buf[OFF_VERSION..OFF_VERSION + 2], PAGE_VERSION);
    LittleEndian::write_u16(&mut buf[OFF_TYPE..OFF_TYPE + 2], ptype);
    LittleEndian::write_u64(&mut buf[OFF_PAGE_ID..OFF_PAGE_ID + 8], page_id);
}

/// Проверить префикс страницы и вернуть её тип.
/// Несовпадение магии/версии/page_id — Corruption (фатально для траверса).
pub fn page_check_header(buf: &[u8], page_id: PageId) -> Result<u16> {
    if buf.len() < PAGE_HDR_SIZE + TRAILER_LEN {
        return Err(ObexError::corruption(format!(
            "page {} buffer too small ({} bytes)",
            page_id,
            buf.len()
        )));
    }
    if &buf[OFF_MAGIC..OFF_MAGIC + 4] != PAGE_MAGIC {
        return Err(ObexError::corruption(format!(
            "bad page magic on page {}",
            page_id
        )));
    }
    let ver = LittleEndian::read_u16(&buf[OFF_VERSION..OFF_VERSION + 2]);
    if ver != PAGE_VERSION {
        return Err(ObexError::corruption(format!(
            "unsupported page version {} on page {}",
            ver, page_id
        )));
    }
    let stored_pid = LittleEndian::read_u64(&buf[OFF_PAGE_ID..OFF_PAGE_ID + 8]);
    if stored_pid != page_id {
        return Err(ObexError::corruption(format!(
            "page id mismatch: header says {}, read at {}",
            stored_pid, page_id
        )));
    }
    Ok(LittleEndian::read_u16(&buf[OFF_TYPE..OFF_TYPE + 2]))
}

/// Проверить, что страница имеет ожидаемый тип.
pub fn page_expect_type(buf: &[u8], page_id: PageId, expected: u16) -> Result<()> {
    let t = page_check_header(buf, page_id)?;
    if t != expected {
        return Err(ObexError::corruption(format!(
            "unexpected page type {} on page {} (expected {})",
            t, page_id, expected
        )));
    }
    Ok(())
}
