//! extent — версионно-привязанный итератор по всем экземплярам класса.
//!
//! Итератор держит собственный пин версии: страницы его снапшота не
//! реклаймятся, пока он жив, даже если транзакция сессии уже закончилась.
//! Позиция отслеживается по ключу primary-индекса (то есть по OID), а не по
//! смещению страницы: COW-перестройки не могут его рассинхронизировать.
//!
//! Поведение после чужого/своего коммита, изменившего primary, задаётся
//! конфигурацией (IterPolicy):
//!   Invalidate — следующий next() падает с UsageError "invalidated by commit";
//!   Exhaust    — итератор молча ведёт себя как исчерпанный.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::codec::decode_object;
use crate::config::IterPolicy;
use crate::errors::{ObexError, Result};
use crate::index::RangeCursor;
use crate::metrics::record_iterator_invalidated;
use crate::session::{ObjectHandle, Session, Slot};
use crate::session::{CachedObject, LifecycleState};
use crate::store::{ReaderGuard, StoreInner};
use crate::types::{Oid, VersionId};

pub struct ExtentIterator {
    store: Arc<StoreInner>,
    session_id: u64,
    _reader: ReaderGuard,
    bound_version: VersionId,
    class_ids: Vec<u32>,
    policy: IterPolicy,
    cursor: RangeCursor,
    done: bool,
}

impl ExtentIterator {
    pub(crate) fn create(
        sess: &mut Session,
        class: &str,
        include_subclasses: bool,
    ) -> Result<ExtentIterator> {
        sess.require_txn()?;
        let class_ids = {
            let schemas = sess.lock_schemas()?;
            if include_subclasses {
                schemas.class_ids_with_subclasses(class)?
            } else {
                vec![schemas.class(class)?.class_id]
            }
        };
        let store = Arc::clone(&sess.store);
        let (version, primary_root) = {
            let txn = sess
                .txn
                .as_ref()
                .ok_or_else(|| ObexError::usage("no active transaction"))?;
            (txn.version, txn.catalog.primary_root)
        };
        let reader = store.pin_version(version)?;
        Ok(ExtentIterator {
            store,
            session_id: sess.id(),
            _reader: reader,
            bound_version: version,
            class_ids,
            policy: sess.store.cfg.iter_policy,
            cursor: RangeCursor::new(primary_root, None, None, false),
            done: false,
        })
    }

    /// Версия, к которой привязан снапшот итератора.
    pub fn version(&self) -> VersionId {
        self.bound_version
    }

    /// Следующий объект экстента. Объект материализуется в кэше сессии
    /// (или возвращается уже существующий handle того же OID).
    pub fn next(&mut self, sess: &mut Session) -> Result<Option<ObjectHandle>> {
        sess.check_open()?;
        if sess.id() != self.session_id {
            return Err(ObexError::usage("iterator belongs to a foreign session"));
        }
        if self.done {
            return Ok(None);
        }

        // Коммит, изменивший primary после привязки, закрывает итератор.
        let cur_epoch = {
            let st = self
                .store
                .state
                .lock()
                .map_err(|_| ObexError::corruption("store state poisoned"))?;
            st.catalog.primary_epoch
        };
        if cur_epoch > self.bound_version {
            self.done = true;
            record_iterator_invalidated();
            match self.policy {
                IterPolicy::Invalidate => {
                    return Err(ObexError::usage("extent iterator invalidated by commit"));
                }
                IterPolicy::Exhaust => return Ok(None),
            }
        }
        sess.require_txn()?;

        loop {
            let hit = {
                let pager = sess.lock_pager()?;
                self.cursor.next(&pager)?
            };
            let (key, val) = match hit {
                Some(x) => x,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            if val.len() != 16 {
                return Err(ObexError::corruption("primary entry has bad length"));
            }
            let oid: Oid = BigEndian::read_u64(&key.bytes);
            let page = LittleEndian::read_u64(&val[0..8]);
            let version = LittleEndian::read_u64(&val[8..16]);

            // Несохранённые удаления этой же сессии не выдаются.
            if let Some(o) = sess.cache.get(Slot::Oid(oid)) {
                if o.state.is_deleted() {
                    continue;
                }
                // Класс уже известен из кэша (если объект активировался).
                if o.class_id != 0 {
                    if !self.class_ids.contains(&o.class_id) {
                        continue;
                    }
                    return Ok(Some(sess.handle(Slot::Oid(oid))));
                }
            }

            // Чтение записи: класс-фильтр + материализация.
            let payload = {
                let pager = sess.lock_pager()?;
                let (_, payload) = sess.store.read_record(&pager, page, oid)?;
                payload
            };
            let img = decode_object(&payload)?;
            if !self.class_ids.contains(&img.class_id) {
                continue;
            }
            if sess.cache.contains(Slot::Oid(oid)) {
                // Hollow-handle того же OID: наполняем на месте.
                if let Some(o) = sess.cache.get_mut(Slot::Oid(oid)) {
                    o.class_id = img.class_id;
                    o.schema_ver = img.schema_ver;
                    o.values = img.values;
                    o.home_page = page;
                    o.load_version = version;
                    o.state = LifecycleState::PersistentClean;
                }
            } else {
                sess.cache.insert(
                    Slot::Oid(oid),
                    CachedObject {
                        class_id: img.class_id,
                        schema_ver: img.schema_ver,
                        state: LifecycleState::PersistentClean,
                        home_page: page,
                        load_version: version,
                        values: img.values,
                        pre_image: None,
                    },
                );
            }
            return Ok(Some(sess.handle(Slot::Oid(oid))));
        }
    }
}
