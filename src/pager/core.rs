//! pager/core — ядро Pager: структура, open(), флаг data_fsync и общие помощники.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::errors::{ObexError, Result};
use crate::meta::{read_meta, MetaHeader};
use crate::types::PageId;

use super::{DATA_SEG_EXT, DATA_SEG_PREFIX, SEGMENT_SIZE};

/// Низкоуровневый менеджер страниц.
pub struct Pager {
    pub root: PathBuf,
    pub meta: MetaHeader,
    // Управляет fsync сегментов при записи страниц.
    pub(crate) data_fsync: bool,
}

impl Pager {
    /// Открыть pager по meta v1.
    pub fn open(root: &Path) -> Result<Self> {
        let m = read_meta(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            meta: m,
            data_fsync: true,
        })
    }

    /// Включить/выключить fsync данных при записях.
    pub fn set_data_fsync(&mut self, on: bool) {
        self.data_fsync = on;
    }
    pub fn data_fsync(&self) -> bool {
        self.data_fsync
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    // ---------------- internal helpers ----------------

    /// Сколько страниц помещается в один сегмент при заданном page_size.
    pub(crate) fn pages_per_seg(&self) -> u64 {
        let ps = self.meta.page_size as u64;
        (SEGMENT_SIZE / ps).max(1)
    }

    /// Сопоставить page_id в (номер сегмента, смещение внутри сегмента).
    pub(crate) fn locate(&self, page_id: PageId) -> (u64, u64) {
        let pps = self.pages_per_seg();
        let seg_no = (page_id / pps) + 1;
        let off_in_seg = (page_id % pps) * (self.meta.page_size as u64);
        (seg_no, off_in_seg)
    }

    /// Путь к файлу сегмента по его номеру.
    pub(crate) fn seg_path(&self, seg_no: u64) -> PathBuf {
        self.root
            .join(format!("{}{:06}.{}", DATA_SEG_PREFIX, seg_no, DATA_SEG_EXT))
    }

    /// Открыть сегмент на чтение/запись (create=true — создать, если отсутствует).
    pub(crate) fn open_seg_rw(&self, seg_no: u64, create: bool) -> Result<std::fs::File> {
        let path = self.seg_path(seg_no);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if create {
            opts.create(true);
        }
        opts.open(&path).map_err(|e| {
            ObexError::corruption(format!("open segment {}: {}", path.display(), e))
        })
    }
}
