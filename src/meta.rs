// src/meta.rs — ObexDB meta v1
//
// Формат <root>/meta (LE):
// MAGIC8 = "OBXMETA1"
// u32 version            = 1
// u32 page_size          (4 KiB..=1 MiB, power of two)
// u32 flags              (резерв)
// u64 next_page_id
// u64 next_oid           (OID монотонны, после удаления не переиспользуются)
// u64 committed_version  (номер последнего опубликованного коммита)
// u64 root_page          (ROOT_CATALOG страница; NO_PAGE у пустого стора)
// u8  clean_shutdown     (1=clean, 0=unclean)
// u32 crc32              (crc32fast по всем предыдущим байтам, включая магию)
//
// Политика:
// - Атомарная запись: tmp+rename, затем fsync родительского каталога (best-effort).
// - Перезапись meta — ЕДИНСТВЕННЫЙ момент публикации нового корня (pointer swap).
//   Все страницы нового коммита должны быть durable ДО rename.
// - Битая магия/CRC/версия при open — Corruption, без попыток восстановления.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{ObexError, Result};
use crate::types::{Oid, PageId, VersionId, NO_PAGE};

const META_MAGIC: &[u8; 8] = b"OBXMETA1";
const META_FILE: &str = "meta";
const META_VERSION: u32 = 1;

// magic8 + 3*u32 + 4*u64 + u8
const META_PAYLOAD_LEN: usize = 8 + 4 * 3 + 8 * 4 + 1;

#[derive(Debug, Clone)]
pub struct MetaHeader {
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub next_page_id: PageId,
    pub next_oid: Oid,
    pub committed_version: VersionId,
    pub root_page: PageId,
    pub clean_shutdown: bool,
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self {
            version: META_VERSION,
            page_size: 4096,
            flags: 0,
            next_page_id: 0,
            next_oid: 1, // OID 0 зарезервирован как "нет объекта"
            committed_version: 0,
            root_page: NO_PAGE,
            clean_shutdown: true,
        }
    }
}

#[inline]
fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Проверка корректности размера страницы (2^n, 4 KiB .. 1 MiB).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    const MAX: u32 = 1 << 20;
    if page_size < 4096 || page_size > MAX || (page_size & (page_size - 1)) != 0 {
        return Err(ObexError::usage(format!(
            "page_size must be a power of two in [4096 .. 1048576], got {}",
            page_size
        )));
    }
    Ok(())
}

fn encode_meta(h: &MetaHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(META_PAYLOAD_LEN + 4);
    buf.write_all(META_MAGIC)?;
    buf.write_u32::<LittleEndian>(h.version)?;
    buf.write_u32::<LittleEndian>(h.page_size)?;
    buf.write_u32::<LittleEndian>(h.flags)?;
    buf.write_u64::<LittleEndian>(h.next_page_id)?;
    buf.write_u64::<LittleEndian>(h.next_oid)?;
    buf.write_u64::<LittleEndian>(h.committed_version)?;
    buf.write_u64::<LittleEndian>(h.root_page)?;
    buf.write_u8(if h.clean_shutdown { 1 } else { 0 })?;
    let crc = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

/// Создать новый meta. Ошибка, если уже существует.
pub fn write_meta_new(root: &Path, h: &MetaHeader) -> Result<()> {
    validate_page_size(h.page_size)?;
    let path = meta_path(root);
    if path.exists() {
        return Err(ObexError::usage(format!(
            "meta already exists at {}",
            path.display()
        )));
    }
    write_meta_tmp_rename(root, h)
}

/// Перезаписать meta через tmp+rename. Это и есть публикация корня.
pub fn write_meta_overwrite(root: &Path, h: &MetaHeader) -> Result<()> {
    validate_page_size(h.page_size)?;
    write_meta_tmp_rename(root, h)
}

fn write_meta_tmp_rename(root: &Path, h: &MetaHeader) -> Result<()> {
    let path = meta_path(root);
    let tmp = root.join(format!("{}.tmp", META_FILE));
    let _ = fs::remove_file(&tmp); // best-effort

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&encode_meta(h)?)?;
    f.sync_all()?; // tmp durable до rename

    fs::rename(&tmp, &path)?;
    let _ = fsync_dir(&path);
    Ok(())
}

/// Прочитать и проверить meta.
pub fn read_meta(root: &Path) -> Result<MetaHeader> {
    let path = meta_path(root);
    let mut f = OpenOptions::new().read(true).open(&path).map_err(|e| {
        ObexError::corruption(format!("open meta {}: {}", path.display(), e))
    })?;

    let mut raw = Vec::new();
    f.read_to_end(&mut raw)?;
    if raw.len() != META_PAYLOAD_LEN + 4 {
        return Err(ObexError::corruption(format!(
            "meta {} has wrong size {} (expected {})",
            path.display(),
            raw.len(),
            META_PAYLOAD_LEN + 4
        )));
    }

    let (payload, tail) = raw.split_at(META_PAYLOAD_LEN);
    let stored_crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let calc_crc = crc32fast::hash(payload);
    if stored_crc != calc_crc {
        return Err(ObexError::corruption(format!(
            "meta CRC mismatch in {} (stored={:#010x}, calc={:#010x})",
            path.display(),
            stored_crc,
            calc_crc
        )));
    }

    let mut r = payload;
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != META_MAGIC {
        return Err(ObexError::corruption(format!(
            "bad meta magic in {} (expected {:?}, got {:?})",
            path.display(),
            META_MAGIC,
            magic
        )));
    }

    let version = r.read_u32::<LittleEndian>()?;
    if version != META_VERSION {
        return Err(ObexError::corruption(format!(
            "unsupported meta version {} in {} (expected {})",
            version,
            path.display(),
            META_VERSION
        )));
    }

    let page_size = r.read_u32::<LittleEndian>()?;
    validate_page_size(page_size)
        .map_err(|_| ObexError::corruption(format!("illegal page_size {} in meta", page_size)))?;
    let flags = r.read_u32::<LittleEndian>()?;
    let next_page_id = r.read_u64::<LittleEndian>()?;
    let next_oid = r.read_u64::<LittleEndian>()?;
    let committed_version = r.read_u64::<LittleEndian>()?;
    let root_page = r.read_u64::<LittleEndian>()?;
    let clean_shutdown = r.read_u8()? != 0;

    Ok(MetaHeader {
        version,
        page_size,
        flags,
        next_page_id,
        next_oid,
        committed_version,
        root_page,
        clean_shutdown,
    })
}

/// Пометить meta.clean_shutdown (перезапись только при изменении).
pub fn set_clean_shutdown(root: &Path, clean: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.clean_shutdown != clean {
        m.clean_shutdown = clean;
        write_meta_overwrite(root, &m)?;
    }
    Ok(())
}

/// Инициализация meta нового стора.
pub fn init_meta(root: &Path, page_size: u32) -> Result<()> {
    let m = MetaHeader {
        page_size,
        ..MetaHeader::default()
    };
    write_meta_new(root, &m)
}
