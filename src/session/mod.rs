//! session — пользовательская сессия: карта идентичности, явные транзакции,
//! ленивая активация полей и оптимистичный коммит.
//!
//! Поток владеет Session монопольно; разделяемое состояние стора живёт в
//! StoreInner под своими замками. Все операции над handle идут через
//! ensure_active(mode): это единственная точка, где Hollow-объект
//! перечитывается со страницы, а Clean переводится в Dirty.

pub mod cache;
pub mod commit;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::codec::{decode_object, Value};
use crate::errors::{ObexError, Result};
use crate::metrics::record_activation;
use crate::schema::FieldDef;
use crate::store::{ReaderGuard, StoreInner};
use crate::types::{Oid, VersionId, NO_PAGE};

pub use cache::{ActivationMode, CachedObject, LifecycleState, ObjectCache, Slot};

/// Лёгкий токен объекта. Валиден только в породившей его сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHandle {
    pub(crate) session: u64,
    pub(crate) slot: Slot,
}

/// Контекст активной транзакции: пин версии + снапшот каталога корней.
pub(crate) struct TxnCtx {
    pub(crate) _reader: ReaderGuard,
    pub(crate) catalog: crate::page::RootCatalog,
    pub(crate) version: VersionId,
}

pub struct Session {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) id: u64,
    pub(crate) cache: ObjectCache,
    pub(crate) txn: Option<TxnCtx>,
    pub(crate) next_transient: u64,
    closed: bool,
}

impl Session {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        let id = store.next_session.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            id,
            cache: ObjectCache::new(),
            txn: None,
            next_transient: 1,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Начать транзакцию: привязка к текущей опубликованной версии.
    pub fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.txn.is_some() {
            return Err(ObexError::usage("transaction is already active"));
        }
        let (reader, catalog, version) = self.store.pin_current()?;
        log::debug!("session {}: begin at version {}", self.id, version);
        self.txn = Some(TxnCtx {
            _reader: reader,
            catalog,
            version,
        });
        Ok(())
    }

    /// Откат: несохранённые изменения отбрасываются, хранилище не трогается.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if self.txn.is_none() {
            return Err(ObexError::usage("rollback without an active transaction"));
        }
        self.cache.rollback();
        self.txn = None;
        log::debug!("session {}: rollback", self.id);
        Ok(())
    }

    /// Оптимистичный коммит (см. session::commit).
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        commit::commit_session(self)
    }

    /// Закрыть сессию; все handle становятся недействительными.
    pub fn close(&mut self) {
        if self.txn.is_some() {
            self.cache.rollback();
            self.txn = None;
        }
        self.closed = true;
    }

    // ---------- Создание и открытие объектов ----------

    /// Новый transient-объект класса class со значениями в порядке полей
    /// последней версии схемы.
    pub fn new_object(&mut self, class: &str, values: Vec<Value>) -> Result<ObjectHandle> {
        self.require_txn()?;
        let (class_id, schema_ver, fields) = self.class_latest(class)?;
        if values.len() != fields.len() {
            return Err(ObexError::usage(format!(
                "class {}: expected {} field values, got {}",
                class,
                fields.len(),
                values.len()
            )));
        }
        for (fd, v) in fields.iter().zip(&values) {
            if !v.matches(fd.kind) {
                return Err(ObexError::usage(format!(
                    "field {}: value does not match declared type {:?}",
                    fd.name, fd.kind
                )));
            }
        }
        let hid = self.next_transient;
        self.next_transient += 1;
        self.cache.insert(
            Slot::Transient(hid),
            CachedObject {
                class_id,
                schema_ver,
                state: LifecycleState::Transient,
                home_page: NO_PAGE,
                load_version: 0,
                values,
                pre_image: None,
            },
        );
        Ok(self.handle(Slot::Transient(hid)))
    }

    /// Перевести transient-объект в PersistentNew; выдаёт постоянный OID.
    pub fn make_persistent(&mut self, h: ObjectHandle) -> Result<Oid> {
        self.check_handle(h)?;
        self.require_txn()?;
        let hid = match h.slot {
            Slot::Transient(hid) => hid,
            Slot::Oid(_) => {
                return Err(ObexError::usage("make_persistent: handle is already persistent"))
            }
        };
        let oid = self.store.alloc_oid();
        self.cache.promote(hid, oid)?;
        log::trace!("session {}: oid {} assigned", self.id, oid);
        Ok(oid)
    }

    /// Открыть persistent-объект по OID. Возвращает Hollow-handle; данные
    /// подтянутся при первом доступе к полю. Один OID — один handle.
    pub fn open(&mut self, oid: Oid) -> Result<ObjectHandle> {
        self.require_txn()?;
        if self.cache.contains(Slot::Oid(oid)) {
            return Ok(self.handle(Slot::Oid(oid)));
        }
        let (page, version) = {
            let pager = self.lock_pager()?;
            let txn = self.txn.as_ref().ok_or_else(|| {
                ObexError::usage("open outside an active transaction")
            })?;
            self.store
                .primary_lookup(&pager, txn.catalog.primary_root, oid)?
                .ok_or(ObexError::NotFound(oid))?
        };
        self.cache.insert(
            Slot::Oid(oid),
            CachedObject {
                class_id: 0, // станет известен при активации
                schema_ver: 0,
                state: LifecycleState::Hollow,
                home_page: page,
                load_version: version,
                values: Vec::new(),
                pre_image: None,
            },
        );
        Ok(self.handle(Slot::Oid(oid)))
    }

    /// OID handle'а (после make_persistent — настоящий).
    pub fn oid_of(&self, h: ObjectHandle) -> Result<Oid> {
        self.check_handle(h)?;
        match self.cache.canonical(h.slot) {
            Slot::Oid(oid) => Ok(oid),
            Slot::Transient(_) => Err(ObexError::usage("object is not persistent yet")),
        }
    }

    // ---------- Активация и доступ к полям ----------

    /// Явная точка активации: каждый доступ к полю проходит через неё.
    /// Read: Hollow перечитывается со страницы. Write: дополнительно
    /// Clean -> Dirty со снятием pre-image.
    pub fn ensure_active(&mut self, h: ObjectHandle, mode: ActivationMode) -> Result<()> {
        self.check_handle(h)?;
        self.require_txn()?;
        let slot = self.cache.canonical(h.slot);
        let state = self
            .cache
            .get(slot)
            .ok_or_else(|| ObexError::usage("handle does not belong to this session"))?
            .state;

        match state {
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                return Err(ObexError::usage("object is deleted"));
            }
            LifecycleState::Hollow => self.load_hollow(slot)?,
            _ => {}
        }

        if mode == ActivationMode::Write {
            self.migrate_to_latest(slot)?;
            let obj = self.cache.get_mut(slot).ok_or_else(|| {
                ObexError::usage("handle does not belong to this session")
            })?;
            match obj.state {
                LifecycleState::PersistentClean => {
                    obj.pre_image = Some(obj.values.clone());
                    obj.state = LifecycleState::PersistentDirty;
                }
                LifecycleState::Transient
                | LifecycleState::PersistentNew
                | LifecycleState::PersistentDirty => {}
                _ => return Err(ObexError::usage("object is not writable in its state")),
            }
        }
        Ok(())
    }

    /// Прочитать поле по имени. Поле, добавленное более новой версией схемы,
    /// чем у объекта, читается как Null.
    pub fn get_field(&mut self, h: ObjectHandle, field: &str) -> Result<Value> {
        self.ensure_active(h, ActivationMode::Read)?;
        let slot = self.cache.canonical(h.slot);
        let (class_id, schema_ver) = {
            let obj = self.cache.get(slot).ok_or_else(|| {
                ObexError::usage("handle does not belong to this session")
            })?;
            (obj.class_id, obj.schema_ver)
        };
        let (pos, known_latest) = self.field_pos(class_id, schema_ver, field)?;
        let obj = self.cache.get(slot).ok_or_else(|| {
            ObexError::usage("handle does not belong to this session")
        })?;
        match pos {
            Some(p) => Ok(obj.values.get(p).cloned().unwrap_or(Value::Null)),
            None if known_latest => Ok(Value::Null),
            None => Err(ObexError::usage(format!("unknown field {}", field))),
        }
    }

    /// Записать поле. Объект мигрирует на последнюю версию схемы класса.
    pub fn set_field(&mut self, h: ObjectHandle, field: &str, value: Value) -> Result<()> {
        self.ensure_active(h, ActivationMode::Write)?;
        let slot = self.cache.canonical(h.slot);
        let (class_id, schema_ver) = {
            let obj = self.cache.get(slot).ok_or_else(|| {
                ObexError::usage("handle does not belong to this session")
            })?;
            (obj.class_id, obj.schema_ver)
        };
        let (pos, kind) = {
            let schemas = self.lock_schemas()?;
            let desc = schemas.class_by_id(class_id)?;
            let fields = desc.fields_at(schema_ver)?;
            match fields.iter().position(|f| f.name == field) {
                Some(p) => (p, fields[p].kind),
                None => return Err(ObexError::usage(format!("unknown field {}", field))),
            }
        };
        if !value.matches(kind) {
            return Err(ObexError::usage(format!(
                "field {}: value does not match declared type {:?}",
                field, kind
            )));
        }
        let obj = self.cache.get_mut(slot).ok_or_else(|| {
            ObexError::usage("handle does not belong to this session")
        })?;
        obj.values[pos] = value;
        Ok(())
    }

    // ---------- Удаление и вытеснение ----------

    /// Пометить объект удалённым. Повторное удаление — UsageError.
    /// Persistent-объект предварительно активируется: его образ нужен,
    /// чтобы снять индексные записи при коммите.
    pub fn delete(&mut self, h: ObjectHandle) -> Result<()> {
        self.check_handle(h)?;
        self.require_txn()?;
        let slot = self.cache.canonical(h.slot);
        let state = self
            .cache
            .get(slot)
            .ok_or_else(|| ObexError::usage("delete: handle is not cached in this session"))?
            .state;
        if state == LifecycleState::Hollow {
            self.load_hollow(slot)?;
        }
        self.cache.mark_deleted(slot)
    }

    /// Явное вытеснение: Clean -> Hollow, прочие состояния — no-op.
    pub fn evict(&mut self, h: ObjectHandle) -> Result<()> {
        self.check_handle(h)?;
        let slot = self.cache.canonical(h.slot);
        let fields = match self.cache.get(slot) {
            Some(o) if o.state == LifecycleState::PersistentClean => {
                self.class_fields(o.class_id, o.schema_ver)?
            }
            _ => return Ok(()),
        };
        let retain = self.store.cfg.retain_primitives;
        self.cache.evict(slot, &fields, retain);
        Ok(())
    }

    // ---------- Запросы ----------

    /// Итератор экстента класса (см. extent.rs).
    pub fn extent(
        &mut self,
        class: &str,
        include_subclasses: bool,
    ) -> Result<crate::extent::ExtentIterator> {
        crate::extent::ExtentIterator::create(self, class, include_subclasses)
    }

    /// Выполнить запрос (см. query.rs).
    pub fn query(&mut self, q: &crate::query::Query) -> Result<Vec<ObjectHandle>> {
        crate::query::execute(self, q)
    }

    // ---------- Внутреннее ----------

    pub(crate) fn handle(&self, slot: Slot) -> ObjectHandle {
        ObjectHandle {
            session: self.id,
            slot,
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ObexError::usage("session is closed"));
        }
        Ok(())
    }

    pub(crate) fn check_handle(&self, h: ObjectHandle) -> Result<()> {
        self.check_open()?;
        if h.session != self.id {
            return Err(ObexError::usage("handle belongs to a foreign session"));
        }
        Ok(())
    }

    pub(crate) fn require_txn(&self) -> Result<()> {
        self.check_open()?;
        if self.txn.is_none() {
            return Err(ObexError::usage("no active transaction"));
        }
        Ok(())
    }

    pub(crate) fn lock_pager(&self) -> Result<std::sync::MutexGuard<'_, crate::pager::Pager>> {
        self.store
            .pager
            .lock()
            .map_err(|_| ObexError::corruption("pager poisoned"))
    }

    pub(crate) fn lock_schemas(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, crate::schema::SchemaCatalog>> {
        self.store
            .schemas
            .lock()
            .map_err(|_| ObexError::corruption("schema catalog poisoned"))
    }

    fn class_latest(&self, class: &str) -> Result<(u32, u16, Vec<FieldDef>)> {
        let schemas = self.lock_schemas()?;
        let desc = schemas.class(class)?;
        let ver = desc.latest_version();
        Ok((desc.class_id, ver, desc.fields_at(ver)?.to_vec()))
    }

    pub(crate) fn class_fields(&self, class_id: u32, ver: u16) -> Result<Vec<FieldDef>> {
        let schemas = self.lock_schemas()?;
        Ok(schemas.class_by_id(class_id)?.fields_at(ver)?.to_vec())
    }

    /// Позиция поля в схеме объекта + известно ли имя последней версии.
    fn field_pos(
        &self,
        class_id: u32,
        schema_ver: u16,
        field: &str,
    ) -> Result<(Option<usize>, bool)> {
        let schemas = self.lock_schemas()?;
        let desc = schemas.class_by_id(class_id)?;
        let own = desc.fields_at(schema_ver)?;
        if let Some(p) = own.iter().position(|f| f.name == field) {
            return Ok((Some(p), true));
        }
        let latest = desc.fields_at(desc.latest_version())?;
        Ok((None, latest.iter().any(|f| f.name == field)))
    }

    /// Перечитать Hollow-объект со страницы. Primary пересматривается на
    /// версии транзакции: после чужих коммитов домашняя страница могла
    /// смениться, а сам объект — исчезнуть (NotFound).
    fn load_hollow(&mut self, slot: Slot) -> Result<()> {
        let oid = match slot {
            Slot::Oid(oid) => oid,
            Slot::Transient(_) => {
                return Err(ObexError::corruption("transient object in hollow state"))
            }
        };
        let (page, version, payload) = {
            let txn = self
                .txn
                .as_ref()
                .ok_or_else(|| ObexError::usage("activation outside an active transaction"))?;
            let pager = self.lock_pager()?;
            let (page, version) = self
                .store
                .primary_lookup(&pager, txn.catalog.primary_root, oid)?
                .ok_or(ObexError::NotFound(oid))?;
            let (_, payload) = self.store.read_record(&pager, page, oid)?;
            (page, version, payload)
        };
        let img = decode_object(&payload)?;
        let obj = self
            .cache
            .get_mut(slot)
            .ok_or_else(|| ObexError::usage("handle does not belong to this session"))?;
        obj.class_id = img.class_id;
        obj.schema_ver = img.schema_ver;
        obj.values = img.values;
        obj.home_page = page;
        obj.load_version = version;
        obj.state = LifecycleState::PersistentClean;
        record_activation();
        Ok(())
    }

    /// Миграция образа к последней версии схемы класса (по именам полей;
    /// новые поля получают Null). Вызывается на write-активации.
    fn migrate_to_latest(&mut self, slot: Slot) -> Result<()> {
        let (class_id, schema_ver) = match self.cache.get(slot) {
            Some(o) => (o.class_id, o.schema_ver),
            None => return Err(ObexError::usage("handle does not belong to this session")),
        };
        let (latest_ver, old_fields, new_fields) = {
            let schemas = self.lock_schemas()?;
            let desc = schemas.class_by_id(class_id)?;
            let latest = desc.latest_version();
            if latest == schema_ver {
                return Ok(());
            }
            (
                latest,
                desc.fields_at(schema_ver)?.to_vec(),
                desc.fields_at(latest)?.to_vec(),
            )
        };
        let obj = self
            .cache
            .get_mut(slot)
            .ok_or_else(|| ObexError::usage("handle does not belong to this session"))?;
        let mut migrated = Vec::with_capacity(new_fields.len());
        for nf in &new_fields {
            let v = old_fields
                .iter()
                .position(|of| of.name == nf.name && of.kind == nf.kind)
                .and_then(|p| obj.values.get(p).cloned())
                .unwrap_or(Value::Null);
            migrated.push(v);
        }
        obj.values = migrated;
        obj.schema_ver = latest_ver;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.txn.is_some() {
            log::debug!("session {}: dropped with an active transaction, rolling back", self.id);
            self.cache.rollback();
            self.txn = None;
        }
    }
}
