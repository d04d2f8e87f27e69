//! free — free-лист с отложенной реклаймацией (файл `<root>/free`).
//!
//! Формат (LE):
//! - Header (16 B):
//!   [magic8="OBXFREE1"][ver u32=1][reserved u32=0]
//! - Tail:
//!   записи по 16 B: [page_id u64][freed_at u64].
//!
//! freed_at — номер опубликованной версии, коммит которой выбросил страницу
//! (0 для страниц, никогда не достижимых из опубликованного корня — их можно
//! переиспользовать сразу). pop(safe_before) отдаёт страницу только если
//! freed_at < safe_before, где safe_before — минимальная версия, на которую
//! ещё смотрит живой reader/итератор. Так старые читатели никогда не увидят
//! перезаписанную страницу.
//!
//! Источник истины для количества — длина файла: (len - HDR) / 16.
//! Вызовы выполняются под внешней синхронизацией (Mutex<Pager> в Store).

use byteorder::{ByteOrder, LittleEndian};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{ObexError, Result};
use crate::types::{PageId, VersionId};

const FREE_FILE: &str = "free";
const FREE_MAGIC: &[u8; 8] = b"OBXFREE1";
const FREE_VER: u32 = 1;
const FREE_HDR_SIZE: u64 = 16;
const FREE_REC_SIZE: u64 = 16;

pub struct FreeList {
    path: PathBuf,
}

impl FreeList {
    /// Создать новый пустой free-лист. Ошибка, если уже существует.
    pub fn create(root: &Path) -> Result<Self> {
        let path = root.join(FREE_FILE);
        if path.exists() {
            return Err(ObexError::usage(format!(
                "free list already exists at {}",
                path.display()
            )));
        }
        let mut f = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        f.write_all(FREE_MAGIC)?;
        let mut buf4 = [0u8; 4];
        LittleEndian::write_u32(&mut buf4, FREE_VER);
        f.write_all(&buf4)?;
        LittleEndian::write_u32(&mut buf4, 0);
        f.write_all(&buf4)?; // reserved
        let _ = f.sync_all();

        Ok(Self { path })
    }

    /// Открыть существующий free-лист и проверить заголовок.
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(FREE_FILE);
        let mut f = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut magic = [0u8; 8];
        f.read_exact(&mut magic)?;
        if &magic != FREE_MAGIC {
            return Err(ObexError::corruption(format!(
                "bad FREE magic in {}",
                path.display()
            )));
        }
        let mut buf4 = [0u8; 4];
        f.read_exact(&mut buf4)?;
        let ver = LittleEndian::read_u32(&buf4);
        if ver != FREE_VER {
            return Err(ObexError::corruption(format!(
                "unsupported FREE version {} in {}",
                ver,
                path.display()
            )));
        }
        f.read_exact(&mut buf4)?; // reserved

        Ok(Self { path })
    }

    /// Открыть либо создать.
    pub fn open_or_create(root: &Path) -> Result<Self> {
        if root.join(FREE_FILE).exists() {
            Self::open(root)
        } else {
            Self::create(root)
        }
    }

    /// Текущее число записей.
    pub fn count(&self) -> Result<u64> {
        let len = std::fs::metadata(&self.path)?.len();
        if len < FREE_HDR_SIZE {
            return Err(ObexError::corruption(format!(
                "free file too small (< header): {}",
                self.path.display()
            )));
        }
        Ok((len - FREE_HDR_SIZE) / FREE_REC_SIZE)
    }

    /// Добавить страницу в хвост списка.
    pub fn push(&self, page_id: PageId, freed_at: VersionId) -> Result<()> {
        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        f.seek(SeekFrom::End(0))?;
        let mut rec = [0u8; 16];
        LittleEndian::write_u64(&mut rec[0..8], page_id);
        LittleEndian::write_u64(&mut rec[8..16], freed_at);
        f.write_all(&rec)?;
        let _ = f.sync_all();
        Ok(())
    }

    /// Добавить пакет страниц одним проходом.
    pub fn push_bulk(&self, pages: &[(PageId, VersionId)]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        f.seek(SeekFrom::End(0))?;
        let mut out = Vec::with_capacity(pages.len() * 16);
        for (pid, freed_at) in pages {
            let mut rec = [0u8; 16];
            LittleEndian::write_u64(&mut rec[0..8], *pid);
            LittleEndian::write_u64(&mut rec[8..16], *freed_at);
            out.extend_from_slice(&rec);
        }
        f.write_all(&out)?;
        let _ = f.sync_all();
        Ok(())
    }

    /// Вытянуть страницу, чья реклаймация безопасна (freed_at < safe_before).
    /// None, если таких нет. Найденная запись замещается последней, файл
    /// усечётся на одну запись.
    pub fn pop(&self, safe_before: VersionId) -> Result<Option<PageId>> {
        let mut f = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = f.metadata()?.len();
        if len < FREE_HDR_SIZE {
            return Err(ObexError::corruption(format!(
                "free file too small (< header): {}",
                self.path.display()
            )));
        }
        let count = (len - FREE_HDR_SIZE) / FREE_REC_SIZE;
        if count == 0 {
            return Ok(None);
        }

        // Ищем с хвоста: свежеосвобождённые страницы чаще безопасны позже,
        // но страницы с freed_at=0 (неопубликованные) лежат где угодно.
        let mut found: Option<(u64, PageId)> = None;
        let mut rec = [0u8; 16];
        for idx in (0..count).rev() {
            let off = FREE_HDR_SIZE + idx * FREE_REC_SIZE;
            f.seek(SeekFrom::Start(off))?;
            f.read_exact(&mut rec)?;
            let pid = LittleEndian::read_u64(&rec[0..8]);
            let freed_at = LittleEndian::read_u64(&rec[8..16]);
            if freed_at < safe_before {
                found = Some((idx, pid));
                break;
            }
        }

        let (idx, pid) = match found {
            Some(x) => x,
            None => return Ok(None),
        };

        // Замещаем найденную запись последней и усечём файл.
        let last_off = FREE_HDR_SIZE + (count - 1) * FREE_REC_SIZE;
        if FREE_HDR_SIZE + idx * FREE_REC_SIZE != last_off {
            f.seek(SeekFrom::Start(last_off))?;
            f.read_exact(&mut rec)?;
            f.seek(SeekFrom::Start(FREE_HDR_SIZE + idx * FREE_REC_SIZE))?;
            f.write_all(&rec)?;
        }
        f.set_len(last_off)?;
        let _ = f.sync_all();
        Ok(Some(pid))
    }

    /// Путь к free-файлу (для диагностики).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "obx-free-{}-{}",
            tag,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn push_pop_respects_generation_gate() {
        let root = temp_root("gate");
        let fl = FreeList::create(&root).unwrap();

        fl.push(10, 5).unwrap(); // освобождена коммитом v5
        fl.push(11, 0).unwrap(); // никогда не публиковалась

        // Живой reader на v4: страница v5 недоступна, «свежая» — доступна.
        assert_eq!(fl.pop(5).unwrap(), Some(11));
        assert_eq!(fl.pop(5).unwrap(), None);

        // Reader ушёл, safe_before подрос — страница v5 реклаймится.
        assert_eq!(fl.pop(6).unwrap(), Some(10));
        assert_eq!(fl.count().unwrap(), 0);
    }

    #[test]
    fn bulk_push_and_reopen() {
        let root = temp_root("bulk");
        let fl = FreeList::create(&root).unwrap();
        fl.push_bulk(&[(1, 1), (2, 2), (3, 3)]).unwrap();
        drop(fl);

        let fl = FreeList::open(&root).unwrap();
        assert_eq!(fl.count().unwrap(), 3);
        // safe_before=3 допускает только freed_at < 3
        let got = fl.pop(3).unwrap().unwrap();
        assert!(got == 1 || got == 2);
    }
}
