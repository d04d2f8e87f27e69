//! store — корневой объект: владеет pager'ом, каталогом корней, free-листом,
//! реестром читателей и выдаёт сессии.
//!
//! Многопоточность внутри одного процесса: pager и состояние под Mutex,
//! публикация коммита сериализована отдельным commit_lock. Межпроцессная
//! защита: эксклюзивный LOCK-файл на время жизни Store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::decode_object;
use crate::config::ObexConfig;
use crate::errors::{ObexError, Result};
use crate::free::FreeList;
use crate::index::{btree_insert, index_name, CowTxn, EntryKey, InsertMode, RangeCursor};
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::meta::{init_meta, read_meta, validate_page_size, write_meta_overwrite};
use crate::metrics::record_pages_freed;
use crate::page::{
    chain_chunk_capacity, decode_chain_page, encode_chain_page, find_record, IndexDef, Node,
    RootCatalog,
};
use crate::pager::Pager;
use crate::schema::SchemaCatalog;
use crate::session::Session;
use crate::types::{Oid, PageId, VersionId, NO_PAGE};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Мутабельное состояние, защищённое одним замком.
pub struct StoreState {
    pub committed_version: VersionId,
    pub catalog: RootCatalog,
    pub catalog_head: PageId,
    /// Версия -> число привязанных к ней читателей (сессии и итераторы).
    pub readers: BTreeMap<VersionId, usize>,
}

impl StoreState {
    /// Гейт реюза: страница с freed_at < safe_before не видна ни одному
    /// живому читателю.
    pub fn safe_before(&self) -> VersionId {
        match self.readers.keys().next() {
            Some(min) => *min + 1,
            None => self.committed_version + 1,
        }
    }
}

pub struct StoreInner {
    pub root: PathBuf,
    pub cfg: ObexConfig,
    pub pager: Mutex<Pager>,
    pub state: Mutex<StoreState>,
    /// Сериализация publish-шага коммитов и DDL.
    pub commit_lock: Mutex<()>,
    pub schemas: Mutex<SchemaCatalog>,
    pub free: FreeList,
    pub next_oid: AtomicU64,
    pub next_session: AtomicU64,
    _lock: LockGuard,
}

/// Пин версии: пока guard жив, страницы его версии не реклаймятся.
pub struct ReaderGuard {
    store: Arc<StoreInner>,
    version: VersionId,
}

impl ReaderGuard {
    pub fn version(&self) -> VersionId {
        self.version
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Ok(mut st) = self.store.state.lock() {
            if let Some(cnt) = st.readers.get_mut(&self.version) {
                *cnt -= 1;
                if *cnt == 0 {
                    st.readers.remove(&self.version);
                }
            }
        }
    }
}

impl StoreInner {
    /// Привязать читателя к текущей опубликованной версии. Возвращает guard
    /// и снапшот каталога этой версии.
    pub fn pin_current(self: &Arc<Self>) -> Result<(ReaderGuard, RootCatalog, VersionId)> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| ObexError::corruption("store state poisoned"))?;
        let v = st.committed_version;
        *st.readers.entry(v).or_insert(0) += 1;
        let cat = st.catalog.clone();
        drop(st);
        Ok((
            ReaderGuard {
                store: Arc::clone(self),
                version: v,
            },
            cat,
            v,
        ))
    }

    /// Дополнительный пин уже запиненной версии (итераторы переживают
    /// транзакцию при политике Exhaust).
    pub fn pin_version(self: &Arc<Self>, version: VersionId) -> Result<ReaderGuard> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| ObexError::corruption("store state poisoned"))?;
        *st.readers.entry(version).or_insert(0) += 1;
        Ok(ReaderGuard {
            store: Arc::clone(self),
            version,
        })
    }

    pub fn alloc_oid(&self) -> Oid {
        self.next_oid.fetch_add(1, Ordering::SeqCst)
    }

    /// Прочитать запись объекта по (home_page, oid). NotFound, если записи
    /// на странице нет.
    pub fn read_record(
        &self,
        pager: &Pager,
        page: PageId,
        oid: Oid,
    ) -> Result<(VersionId, Vec<u8>)> {
        let mut buf = vec![0u8; pager.page_size()];
        pager.read_page(page, &mut buf)?;
        match find_record(&buf, page, oid)? {
            Some(rec) => Ok((rec.version, rec.payload)),
            None => Err(ObexError::NotFound(oid)),
        }
    }

    /// Primary-индекс: OID -> (data_page, version). NotFound при отсутствии.
    pub fn primary_lookup(
        &self,
        pager: &Pager,
        primary_root: PageId,
        oid: Oid,
    ) -> Result<Option<(PageId, VersionId)>> {
        let key = EntryKey::primary(oid);
        match crate::index::btree_lookup(pager, primary_root, &key)? {
            Some(val) => {
                if val.len() != 16 {
                    return Err(ObexError::corruption(format!(
                        "primary entry for oid {} has bad length {}",
                        oid,
                        val.len()
                    )));
                }
                let page = LittleEndian::read_u64(&val[0..8]);
                let version = LittleEndian::read_u64(&val[8..16]);
                Ok(Some((page, version)))
            }
            None => Ok(None),
        }
    }
}

// ---------- Каталог корней: цепочка ROOT_CATALOG страниц ----------

pub fn read_catalog_chain(pager: &Pager, head: PageId) -> Result<RootCatalog> {
    if head == NO_PAGE {
        return Ok(RootCatalog::empty());
    }
    let mut raw = Vec::new();
    let mut pid = head;
    let mut hops = 0u32;
    while pid != NO_PAGE {
        hops += 1;
        if hops > 100_000 {
            return Err(ObexError::corruption("root catalog chain loop"));
        }
        let mut buf = vec![0u8; pager.page_size()];
        pager.read_page(pid, &mut buf)?;
        let (next, chunk) = decode_chain_page(&buf, pid)?;
        raw.extend_from_slice(&chunk);
        pid = next;
    }
    RootCatalog::decode_bytes(&raw)
}

/// Записать каталог новой версии на свежие страницы. Возвращает голову цепи.
pub fn write_catalog_chain(txn: &mut CowTxn<'_>, catalog: &RootCatalog) -> Result<PageId> {
    let raw = catalog.encode_bytes();
    let ps = txn.page_size();
    let cap = chain_chunk_capacity(ps);
    let chunks: Vec<&[u8]> = if raw.is_empty() {
        vec![&raw[..]]
    } else {
        raw.chunks(cap).collect()
    };
    let mut next = NO_PAGE;
    for chunk in chunks.iter().rev() {
        let pid = txn.alloc()?;
        let mut buf = encode_chain_page(pid, next, chunk, ps)?;
        txn.write_raw(pid, &mut buf)?;
        next = pid;
    }
    Ok(next)
}

/// Все страницы поддерева B+Tree (для сноса индекса целиком).
pub fn collect_tree_pages(pager: &Pager, root: PageId) -> Result<Vec<PageId>> {
    let mut out = Vec::new();
    if root == NO_PAGE {
        return Ok(out);
    }
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        let mut buf = vec![0u8; pager.page_size()];
        pager.read_page(pid, &mut buf)?;
        if let Node::Inner { children, .. } = Node::decode(&buf, pid)? {
            stack.extend(children);
        }
        out.push(pid);
    }
    Ok(out)
}

// ---------- Store ----------

#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub committed_version: VersionId,
    pub page_size: u32,
    pub next_page_id: PageId,
    pub next_oid: Oid,
    pub index_count: usize,
    pub data_pages_live: usize,
    pub free_pages: u64,
}

impl Store {
    /// Создать пустой стор в каталоге root.
    pub fn init(root: &Path, page_size: u32) -> Result<()> {
        validate_page_size(page_size)?;
        fs::create_dir_all(root)?;
        init_meta(root, page_size)?;
        FreeList::create(root)?;
        SchemaCatalog::new().save(root)?;
        log::info!(
            "initialized store at {} (page_size={})",
            root.display(),
            page_size
        );
        Ok(())
    }

    /// Открыть стор (эксклюзивно: второй пишущий процесс отбивается на LOCK).
    pub fn open(root: &Path, cfg: ObexConfig) -> Result<Store> {
        let lock = try_acquire_exclusive_lock(root)?;
        let meta = read_meta(root)?;
        if !meta.clean_shutdown {
            log::warn!(
                "store {} was not shut down cleanly; unpublished pages will be reclaimed lazily",
                root.display()
            );
        }

        let mut pager = Pager::open(root)?;
        pager.set_data_fsync(cfg.data_fsync);
        let catalog = read_catalog_chain(&pager, meta.root_page)?;
        let free = FreeList::open_or_create(root)?;

        // Пишущий процесс жив: с этого момента shutdown считается нечистым,
        // пока Drop не докажет обратное.
        let mut m = meta.clone();
        m.clean_shutdown = false;
        write_meta_overwrite(root, &m)?;
        pager.meta.clean_shutdown = false;

        log::info!(
            "opened store {} at version {} ({} indexes, next_oid={})",
            root.display(),
            meta.committed_version,
            catalog.indexes.len(),
            meta.next_oid
        );

        Ok(Store {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                cfg,
                pager: Mutex::new(pager),
                state: Mutex::new(StoreState {
                    committed_version: meta.committed_version,
                    catalog,
                    catalog_head: meta.root_page,
                    readers: BTreeMap::new(),
                }),
                commit_lock: Mutex::new(()),
                schemas: Mutex::new(SchemaCatalog::load(root)?),
                free,
                next_oid: AtomicU64::new(meta.next_oid.max(1)),
                next_session: AtomicU64::new(1),
                _lock: lock,
            }),
        })
    }

    /// Новая сессия. Транзакция начинается явным Session::begin().
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    /// Объявить класс (см. SchemaCatalog::define_class). Публикуется сразу.
    pub fn define_class(
        &self,
        name: &str,
        parent: Option<&str>,
        fields: Vec<crate::schema::FieldDef>,
    ) -> Result<(u32, u16)> {
        let mut cat = self
            .inner
            .schemas
            .lock()
            .map_err(|_| ObexError::corruption("schema catalog poisoned"))?;
        let r = cat.define_class(name, parent, fields)?;
        cat.save(&self.inner.root)?;
        Ok(r)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let pager = self
            .inner
            .pager
            .lock()
            .map_err(|_| ObexError::corruption("pager poisoned"))?;
        let st = self
            .inner
            .state
            .lock()
            .map_err(|_| ObexError::corruption("store state poisoned"))?;
        Ok(StoreStatus {
            committed_version: st.committed_version,
            page_size: pager.meta.page_size,
            next_page_id: pager.meta.next_page_id,
            next_oid: self.inner.next_oid.load(Ordering::SeqCst),
            index_count: st.catalog.indexes.len(),
            data_pages_live: st.catalog.data_live.len(),
            free_pages: self.inner.free.count()?,
        })
    }

    // ---------- DDL: индексы ----------

    /// Создать индекс по полю класса и наполнить его существующими объектами.
    /// Автономная операция со своей публикацией версии. ConstraintError,
    /// если unique-индекс строится над неуникальными данными.
    pub fn create_index(&self, class: &str, field: &str, unique: bool) -> Result<()> {
        let name = index_name(class, field);
        let field_pos;
        let class_id;
        {
            let schemas = self
                .inner
                .schemas
                .lock()
                .map_err(|_| ObexError::corruption("schema catalog poisoned"))?;
            let desc = schemas.class(class)?;
            class_id = desc.class_id;
            let fields = desc.fields_at(desc.latest_version())?;
            field_pos = fields
                .iter()
                .position(|f| f.name == field)
                .ok_or_else(|| {
                    ObexError::usage(format!("class {} has no field {}", class, field))
                })?;
        }

        let _ddl = self
            .inner
            .commit_lock
            .lock()
            .map_err(|_| ObexError::corruption("commit lock poisoned"))?;

        let mut pager = self
            .inner
            .pager
            .lock()
            .map_err(|_| ObexError::corruption("pager poisoned"))?;
        let (mut catalog, old_head, new_version, safe_before) = {
            let st = self
                .inner
                .state
                .lock()
                .map_err(|_| ObexError::corruption("store state poisoned"))?;
            if st.catalog.index(&name).is_some() {
                return Err(ObexError::usage(format!("index {} already exists", name)));
            }
            (
                st.catalog.clone(),
                st.catalog_head,
                st.committed_version + 1,
                st.safe_before(),
            )
        };

        // Наполнение: полный проход primary-индекса, отбор по классу.
        let mut entries: Vec<EntryKey> = Vec::new();
        {
            let mut cur = RangeCursor::new(catalog.primary_root, None, None, false);
            while let Some((k, v)) = cur.next(&pager)? {
                let oid = BigEndian::read_u64(&k.bytes);
                let page = LittleEndian::read_u64(&v[0..8]);
                let mut buf = vec![0u8; pager.page_size()];
                pager.read_page(page, &mut buf)?;
                let rec = find_record(&buf, page, oid)?.ok_or_else(|| {
                    ObexError::corruption(format!(
                        "primary entry for oid {} points at page {} without a record",
                        oid, page
                    ))
                })?;
                let img = decode_object(&rec.payload)?;
                if img.class_id != class_id {
                    continue;
                }
                let val = match img.values.get(field_pos) {
                    Some(crate::codec::Value::Null) | None => continue,
                    Some(v) => v,
                };
                let ik = crate::index::IndexKey::from_value(val)?;
                entries.push(EntryKey::new(ik.encode(), oid));
            }
        }

        let mut txn = CowTxn::new(&mut pager, new_version, safe_before);
        let mode = if unique {
            InsertMode::UniqueStrict
        } else {
            InsertMode::NonUnique
        };
        let mut root = NO_PAGE;
        for key in entries {
            match btree_insert(&mut txn, root, key, Vec::new(), mode) {
                Ok(r) => root = r,
                Err(e) => {
                    let junk = txn.abandon();
                    self.inner.free.push_bulk(&junk)?;
                    return Err(e);
                }
            }
        }

        catalog.indexes.push(IndexDef {
            name: name.clone(),
            unique,
            root,
            epoch: new_version,
        });
        self.inner.publish_locked(txn, catalog, old_head, new_version)?;
        log::info!("created {} index {}", if unique { "unique" } else { "non-unique" }, name);
        Ok(())
    }

    /// Удалить индекс: страницы дерева уходят в free-лист с тегом новой версии.
    pub fn remove_index(&self, class: &str, field: &str) -> Result<()> {
        let name = index_name(class, field);
        let _ddl = self
            .inner
            .commit_lock
            .lock()
            .map_err(|_| ObexError::corruption("commit lock poisoned"))?;
        let mut pager = self
            .inner
            .pager
            .lock()
            .map_err(|_| ObexError::corruption("pager poisoned"))?;
        let (mut catalog, old_head, new_version, safe_before) = {
            let st = self
                .inner
                .state
                .lock()
                .map_err(|_| ObexError::corruption("store state poisoned"))?;
            (
                st.catalog.clone(),
                st.catalog_head,
                st.committed_version + 1,
                st.safe_before(),
            )
        };
        let pos = catalog
            .indexes
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| ObexError::usage(format!("index {} does not exist", name)))?;
        let def = catalog.indexes.remove(pos);

        let tree_pages = collect_tree_pages(&pager, def.root)?;
        let mut txn = CowTxn::new(&mut pager, new_version, safe_before);
        for pid in tree_pages {
            txn.free(pid);
        }
        self.inner.publish_locked(txn, catalog, old_head, new_version)?;
        log::info!("removed index {}", name);
        Ok(())
    }
}

impl StoreInner {
    /// Общий publish-шаг: новая цепь каталога, meta, free-лист, состояние.
    /// Вызывается строго под commit_lock; txn уже держит &mut Pager.
    pub(crate) fn publish_locked(
        &self,
        mut txn: CowTxn<'_>,
        catalog: RootCatalog,
        old_head: PageId,
        new_version: VersionId,
    ) -> Result<()> {
        // Старая цепь каталога вытесняется новой.
        if old_head != NO_PAGE {
            let mut pid = old_head;
            while pid != NO_PAGE {
                let mut buf = vec![0u8; txn.page_size()];
                txn.pager.read_page(pid, &mut buf)?;
                let (next, _) = decode_chain_page(&buf, pid)?;
                txn.free(pid);
                pid = next;
            }
        }
        let new_head = write_catalog_chain(&mut txn, &catalog)?;
        let freed = txn.take_freed();

        txn.pager
            .publish(new_head, new_version, self.next_oid.load(Ordering::SeqCst))?;

        if !freed.is_empty() {
            record_pages_freed(freed.len() as u64);
            self.free.push_bulk(&freed)?;
        }

        let mut st = self
            .state
            .lock()
            .map_err(|_| ObexError::corruption("store state poisoned"))?;
        st.committed_version = new_version;
        st.catalog = catalog;
        st.catalog_head = new_head;
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Финальная фиксация счётчиков + clean_shutdown. Ошибки здесь только
        // логируются: терять их негде.
        if let Ok(mut pager) = self.pager.lock() {
            pager.meta.next_oid = self.next_oid.load(Ordering::SeqCst);
            pager.meta.clean_shutdown = true;
            let root = pager.root.clone();
            let m = pager.meta.clone();
            if let Err(e) = write_meta_overwrite(&root, &m) {
                log::warn!("failed to persist meta on shutdown: {}", e);
            }
        }
    }
}
