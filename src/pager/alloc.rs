//! pager/alloc — аллокация страниц и подготовка сегментов.
//!
//! Правила:
//! - allocate_one_page сначала пытается взять страницу из free-листа, но
//!   только запись с freed_at < safe_before (никакой живой reader не смотрит
//!   на версию, которой страница ещё принадлежала);
//! - иначе — рост файла: allocate_pages из хвоста next_page_id;
//! - meta.next_page_id продвигается только в памяти; на диск попадает при
//!   публикации корня (publish) и при Drop(Store).

use std::collections::BTreeMap;

use crate::errors::Result;
use crate::free::FreeList;
use crate::metrics::{record_page_allocated, record_page_reused};
use crate::types::{PageId, VersionId};

use super::core::Pager;

impl Pager {
    /// Аллокация последовательности новых страниц из хвоста. Возвращает
    /// начальный page_id. Сегменты доращиваются set_len без fsync —
    /// durability страниц обеспечивает write_page перед публикацией.
    pub fn allocate_pages(&mut self, count: u64) -> Result<PageId> {
        let start = self.meta.next_page_id;
        let end = start + count;

        // Максимальная требуемая длина каждого затронутого сегмента.
        let mut seg_max_len: BTreeMap<u64, u64> = BTreeMap::new();
        for pid in start..end {
            let (seg_no, off) = self.locate(pid);
            let need = off + (self.meta.page_size as u64);
            seg_max_len
                .entry(seg_no)
                .and_modify(|v| *v = (*v).max(need))
                .or_insert(need);
        }

        for (seg_no, need_len) in seg_max_len {
            let f = self.open_seg_rw(seg_no, true)?;
            let cur_len = f.metadata()?.len();
            if cur_len < need_len {
                f.set_len(need_len)?;
            }
        }

        self.meta.next_page_id = end;
        for _ in start..end {
            record_page_allocated();
        }
        Ok(start)
    }

    /// Аллокация одной страницы.
    ///
    /// Попытка 1: free-лист с генерационным гейтом (freed_at < safe_before).
    /// Попытка 2: fallback на allocate_pages(1).
    pub fn allocate_one_page(&mut self, safe_before: VersionId) -> Result<PageId> {
        let free_path = self.root.join("free");
        if free_path.exists() {
            if let Ok(fl) = FreeList::open(&self.root) {
                if let Ok(Some(pid)) = fl.pop(safe_before) {
                    self.ensure_allocated(pid)?;
                    record_page_reused();
                    return Ok(pid);
                }
            }
        }
        self.allocate_pages(1)
    }

    /// Гарантировать, что page_id физически аллоцирован на диске.
    pub fn ensure_allocated(&mut self, page_id: PageId) -> Result<()> {
        if page_id >= self.meta.next_page_id {
            let to_alloc = page_id + 1 - self.meta.next_page_id;
            self.allocate_pages(to_alloc)?;
            return Ok(());
        }

        let (seg_no, off) = self.locate(page_id);
        let f = self.open_seg_rw(seg_no, true)?;
        let need_len = off + (self.meta.page_size as u64);
        let cur_len = f.metadata()?.len();
        if cur_len < need_len {
            f.set_len(need_len)?;
            if self.data_fsync {
                let _ = f.sync_all();
            }
        }
        Ok(())
    }
}
