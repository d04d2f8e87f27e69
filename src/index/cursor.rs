//! index/cursor — диапазонный курсор по неизменяемому (опубликованному)
//! корню B+Tree.
//!
//! Позиция отслеживается ПО КЛЮЧУ (последняя выданная запись), а не по
//! смещению страницы: каждый next — повторный спуск от корня. Для COW-дерева
//! это безопасно и устойчиво: перестройка страниц другими операциями никогда
//! не затрагивает страницы, достижимые из привязанного корня.

use crate::errors::Result;
use crate::pager::Pager;
use crate::types::PageId;

use super::btree::{btree_seek_asc, btree_seek_desc};
use super::key::EntryKey;

/// Курсор диапазона [lo .. hi] (границы включительно на уровне EntryKey;
/// эксклюзивность выражается сентинельными OID 0/MAX в границах).
pub struct RangeCursor {
    root: PageId,
    lo: Option<EntryKey>,
    hi: Option<EntryKey>,
    descending: bool,
    /// Последний выданный ключ; None — курсор ещё не стартовал.
    pos: Option<EntryKey>,
}

impl RangeCursor {
    pub fn new(
        root: PageId,
        lo: Option<EntryKey>,
        hi: Option<EntryKey>,
        descending: bool,
    ) -> Self {
        Self {
            root,
            lo,
            hi,
            descending,
            pos: None,
        }
    }

    /// Следующая запись в пределах диапазона.
    pub fn next(&mut self, pager: &Pager) -> Result<Option<(EntryKey, Vec<u8>)>> {
        let hit = if self.descending {
            match &self.pos {
                None => btree_seek_desc(pager, self.root, self.hi.as_ref(), true)?,
                Some(p) => btree_seek_desc(pager, self.root, Some(p), false)?,
            }
        } else {
            match &self.pos {
                None => btree_seek_asc(pager, self.root, self.lo.as_ref(), true)?,
                Some(p) => btree_seek_asc(pager, self.root, Some(p), false)?,
            }
        };

        let (key, val) = match hit {
            Some(x) => x,
            None => return Ok(None),
        };

        // Проверка дальней границы.
        let in_range = if self.descending {
            self.lo.as_ref().map_or(true, |lo| key >= *lo)
        } else {
            self.hi.as_ref().map_or(true, |hi| key <= *hi)
        };
        if !in_range {
            return Ok(None);
        }

        self.pos = Some(key.clone());
        Ok(Some((key, val)))
    }
}
