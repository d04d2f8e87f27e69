//! pager/publish — атомарная публикация нового корня.
//!
//! Единственная точка, в которой новый коммит становится видимым: перезапись
//! meta через tmp+rename. Все страницы новой версии обязаны быть durable ДО
//! этого вызова (write_page с data_fsync, либо явный sync сегментов).
//! Падение до rename оставляет прежний корень полностью целым: новые страницы
//! не достижимы ни из одного опубликованного корня.

use crate::errors::Result;
use crate::meta::write_meta_overwrite;
use crate::types::{Oid, PageId, VersionId};

use super::core::Pager;

impl Pager {
    /// Опубликовать новый корень: root_page + committed_version + счётчики.
    pub fn publish(
        &mut self,
        root_page: PageId,
        committed_version: VersionId,
        next_oid: Oid,
    ) -> Result<()> {
        self.meta.root_page = root_page;
        self.meta.committed_version = committed_version;
        self.meta.next_oid = next_oid;
        // clean_shutdown=false на всё время жизни writer'а; true проставит Drop(Store).
        self.meta.clean_shutdown = false;
        write_meta_overwrite(&self.root, &self.meta)?;
        log::debug!(
            "published root: version={} root_page={} next_page_id={} next_oid={}",
            committed_version,
            root_page,
            self.meta.next_page_id,
            next_oid
        );
        Ok(())
    }
}
