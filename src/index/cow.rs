//! index/cow — контекст одной COW-операции над страницами.
//!
//! Инварианты:
//! - каждая модификация пишет в СВЕЖУЮ страницу (allocate → encode → write);
//! - страницы, вытесненные path copying, не перезаписываются, а копятся в
//!   `freed` с тегом версии: страницы прежних опубликованных корней получают
//!   freed_at = версия текущего коммита, страницы, созданные этой же
//!   операцией и тут же вытесненные (например, промежуточные корни при
//!   bulk-загрузке индекса), — freed_at = 0 (реюз сразу безопасен);
//! - в free-лист всё попадает одним пакетом ПОСЛЕ публикации корня.

use std::collections::HashSet;

use crate::errors::Result;
use crate::metrics::record_cow_copy;
use crate::page::Node;
use crate::pager::Pager;
use crate::types::{PageId, VersionId};

pub struct CowTxn<'a> {
    pub pager: &'a mut Pager,
    /// Версия, которую получит этот коммит (тег для вытесненных страниц).
    commit_version: VersionId,
    /// Минимальная версия, на которую смотрит живой reader (гейт реюза).
    safe_before: VersionId,
    /// Страницы, аллоцированные в рамках этой операции.
    fresh: HashSet<PageId>,
    /// Вытесненные страницы с тегом освобождения.
    pub freed: Vec<(PageId, VersionId)>,
}

impl<'a> CowTxn<'a> {
    pub fn new(pager: &'a mut Pager, commit_version: VersionId, safe_before: VersionId) -> Self {
        Self {
            pager,
            commit_version,
            safe_before,
            fresh: HashSet::new(),
            freed: Vec::new(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    /// Выделить свежую страницу (free-лист с генерационным гейтом или хвост).
    pub fn alloc(&mut self) -> Result<PageId> {
        let pid = self.pager.allocate_one_page(self.safe_before)?;
        self.fresh.insert(pid);
        Ok(pid)
    }

    /// Записать узел B+Tree на свежую страницу, вернуть её id.
    pub fn write_node(&mut self, node: &Node) -> Result<PageId> {
        let pid = self.alloc()?;
        let mut buf = node.encode(pid, self.page_size())?;
        self.pager.write_page(pid, &mut buf)?;
        record_cow_copy();
        Ok(pid)
    }

    /// Записать произвольный уже закодированный буфер на свежую страницу.
    pub fn write_raw(&mut self, pid: PageId, buf: &mut [u8]) -> Result<()> {
        self.pager.write_page(pid, buf)
    }

    /// Пометить страницу вытесненной.
    pub fn free(&mut self, pid: PageId) {
        let tag = if self.fresh.contains(&pid) {
            0
        } else {
            self.commit_version
        };
        self.freed.push((pid, tag));
    }

    /// Перенести накопленный список freed (для слияния нескольких операций
    /// одного коммита).
    pub fn take_freed(&mut self) -> Vec<(PageId, VersionId)> {
        std::mem::take(&mut self.freed)
    }

    /// Отказ от транзакции: все свежие страницы возвращаются как немедленно
    /// переиспользуемые (tag 0 — они никогда не публиковались).
    pub fn abandon(self) -> Vec<(PageId, VersionId)> {
        self.fresh.into_iter().map(|pid| (pid, 0)).collect()
    }
}
