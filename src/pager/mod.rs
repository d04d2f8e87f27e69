//! pager — низкоуровневый менеджер страниц поверх сегментных файлов.
//!
//! Дисциплина COW: write_page легален только для страниц, ещё не достижимых
//! из опубликованного корня; публикация — это перезапись meta (pointer swap),
//! см. pager/publish.rs.

mod alloc;
mod core;
mod io;
mod publish;

pub use core::Pager;

/// Размер одного сегмента данных (256 MiB).
pub const SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

pub(crate) const DATA_SEG_PREFIX: &str = "seg_";
pub(crate) const DATA_SEG_EXT: &str = "obx";
