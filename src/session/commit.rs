//! session/commit — оптимистичный коммит.
//!
//! Протокол:
//!   1. validate    — тег версии каждого dirty/deleted OID против последнего
//!                    опубликованного primary; конфликты собираются ВСЕ,
//!                    не только первый;
//!   2. serialize   — new/dirty объекты кодируются и пакуются в свежие
//!                    страницы данных;
//!   3. index update — COW-вставки/удаления против пред-коммитных корней;
//!   4. publish     — новая цепь каталога + meta-свап (единственный момент
//!                    видимости);
//!   5. post-commit — переходы кэша, опциональное вытеснение.
//!
//! При ConflictError dirty-набор сессии не трогается: вызывающий может
//! откатиться и повторить. Все страницы, записанные до ошибки, никогда не
//! публиковались и возвращаются в free-лист немедленно переиспользуемыми.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{encode_object, Value};
use crate::errors::{ObexError, Result};
use crate::index::{btree_insert, btree_remove, CowTxn, EntryKey, IndexKey, InsertMode};
use crate::metrics::{record_commit, record_commit_conflict};
use crate::page::{max_object_payload, page_body_capacity, DataRecord, RootCatalog};
use crate::store::StoreInner;
use crate::types::{Oid, PageId, VersionId};

use super::cache::{LifecycleState, Slot};
use super::Session;

pub(crate) fn commit_session(sess: &mut Session) -> Result<()> {
    if sess.txn.is_none() {
        return Err(ObexError::usage("commit without an active transaction"));
    }
    let set = sess.cache.commit_set();
    if set.is_empty() {
        // Read-only транзакция: версия не двигается.
        sess.txn = None;
        return Ok(());
    }

    let store = Arc::clone(&sess.store);
    let _commit = store
        .commit_lock
        .lock()
        .map_err(|_| ObexError::corruption("commit lock poisoned"))?;
    let mut pager_guard = store
        .pager
        .lock()
        .map_err(|_| ObexError::corruption("pager poisoned"))?;
    let pager = &mut *pager_guard;

    let (cur_catalog, old_head, cur_version, safe_before) = {
        let st = store
            .state
            .lock()
            .map_err(|_| ObexError::corruption("store state poisoned"))?;
        (
            st.catalog.clone(),
            st.catalog_head,
            st.committed_version,
            st.safe_before(),
        )
    };

    // ---- 1. validate: собираем ВСЕ конфликты ----
    let mut conflicts: Vec<Oid> = Vec::new();
    let mut old_loc: HashMap<Oid, PageId> = HashMap::new();
    for (slot, state) in &set {
        let oid = match slot {
            Slot::Oid(o) => *o,
            Slot::Transient(_) => continue,
        };
        if matches!(
            state,
            LifecycleState::PersistentDirty | LifecycleState::PersistentDeleted
        ) {
            let load_version = sess
                .cache
                .get(*slot)
                .map(|o| o.load_version)
                .ok_or_else(|| ObexError::corruption("commit set references uncached slot"))?;
            match store.primary_lookup(pager, cur_catalog.primary_root, oid)? {
                None => conflicts.push(oid),
                Some((page, ver)) => {
                    if ver != load_version {
                        conflicts.push(oid);
                    } else {
                        old_loc.insert(oid, page);
                    }
                }
            }
        }
    }
    if !conflicts.is_empty() {
        record_commit_conflict();
        log::debug!(
            "session {}: commit rejected, {} conflicting object(s)",
            sess.id,
            conflicts.len()
        );
        return Err(ObexError::conflict(conflicts));
    }

    let new_version = cur_version + 1;
    let ps = pager.page_size();

    // ---- 2. serialize ----
    let mut puts: Vec<(Oid, Vec<u8>)> = Vec::new();
    for (slot, state) in &set {
        if !matches!(
            state,
            LifecycleState::PersistentNew | LifecycleState::PersistentDirty
        ) {
            continue;
        }
        let oid = match slot {
            Slot::Oid(o) => *o,
            Slot::Transient(_) => continue,
        };
        let obj = sess
            .cache
            .get(*slot)
            .ok_or_else(|| ObexError::corruption("commit set references uncached slot"))?;
        let fields = {
            let schemas = store
                .schemas
                .lock()
                .map_err(|_| ObexError::corruption("schema catalog poisoned"))?;
            schemas
                .class_by_id(obj.class_id)?
                .fields_at(obj.schema_ver)?
                .to_vec()
        };
        let payload = encode_object(obj.class_id, obj.schema_ver, &fields, &obj.values)?;
        if payload.len() > max_object_payload(ps) {
            return Err(ObexError::usage(format!(
                "object {} does not fit a single data page ({} bytes)",
                oid,
                payload.len()
            )));
        }
        puts.push((oid, payload));
    }

    let mut txn = CowTxn::new(pager, new_version, safe_before);
    let mut catalog = cur_catalog.clone();
    let mut home: HashMap<Oid, PageId> = HashMap::new();

    let outcome = (|| -> Result<()> {
        // Упаковка записей в страницы данных (first-fit по порядку OID).
        let cap = page_body_capacity(ps) - 2;
        let mut batch: Vec<DataRecord> = Vec::new();
        let mut used = 0usize;
        let flush = |txn: &mut CowTxn<'_>,
                     catalog: &mut RootCatalog,
                     home: &mut HashMap<Oid, PageId>,
                     batch: &mut Vec<DataRecord>|
         -> Result<()> {
            if batch.is_empty() {
                return Ok(());
            }
            let pid = txn.alloc()?;
            let mut buf = crate::page::encode_data_page(batch, pid, ps)?;
            txn.write_raw(pid, &mut buf)?;
            catalog.data_live.insert(pid, batch.len() as u32);
            for r in batch.drain(..) {
                home.insert(r.oid, pid);
            }
            Ok(())
        };
        for (oid, payload) in puts {
            let rec = DataRecord {
                oid,
                version: new_version,
                payload,
            };
            if used + rec.encoded_len() > cap {
                flush(&mut txn, &mut catalog, &mut home, &mut batch)?;
                used = 0;
            }
            used += rec.encoded_len();
            batch.push(rec);
        }
        flush(&mut txn, &mut catalog, &mut home, &mut batch)?;

        // Старые записи перезаписанных/удалённых объектов: страница
        // освобождается, когда на ней не остаётся живых записей.
        for page in old_loc.values() {
            let dead = match catalog.data_live.get_mut(page) {
                Some(cnt) => {
                    *cnt -= 1;
                    *cnt == 0
                }
                None => false,
            };
            if dead {
                catalog.data_live.remove(page);
                txn.free(*page);
            }
        }

        // ---- 3. index update ----
        apply_index_updates(&mut txn, sess, &store, &set, &mut catalog, &home, new_version)
    })();

    if let Err(e) = outcome {
        // Ничего не опубликовано; свежие страницы сразу переиспользуемы.
        let junk = txn.abandon();
        let _ = store.free.push_bulk(&junk);
        return Err(e);
    }

    // ---- 4. publish ----
    store.publish_locked(txn, catalog, old_head, new_version)?;
    drop(pager_guard);
    record_commit();

    // ---- 5. post-commit ----
    sess.cache.after_commit(new_version, &home);
    if store.cfg.evict_on_commit {
        for (slot, state) in sess.cache.snapshot_states() {
            if state == LifecycleState::PersistentClean {
                let h = sess.handle(slot);
                sess.evict(h)?;
            }
        }
    }
    sess.txn = None;
    log::debug!(
        "session {}: committed version {} ({} object(s))",
        sess.id,
        new_version,
        set.len()
    );
    Ok(())
}

/// Кодировка ключа поля для индексных записей; Null не индексируется.
fn field_key_bytes(v: &Value) -> Result<Option<Vec<u8>>> {
    if matches!(v, Value::Null) {
        return Ok(None);
    }
    Ok(Some(IndexKey::from_value(v)?.encode()))
}

/// COW-обновления primary и всех полевых индексов против пред-коммитных
/// корней. Каталог мутируется локально; ошибка на любом шаге оставляет
/// опубликованное состояние нетронутым.
fn apply_index_updates(
    txn: &mut CowTxn<'_>,
    sess: &Session,
    store: &StoreInner,
    set: &[(Slot, LifecycleState)],
    catalog: &mut RootCatalog,
    home: &HashMap<Oid, PageId>,
    new_version: VersionId,
) -> Result<()> {
    // Primary: OID -> [data_page u64][version u64].
    let mut primary = catalog.primary_root;
    for (slot, state) in set {
        let oid = match slot {
            Slot::Oid(o) => *o,
            Slot::Transient(_) => continue,
        };
        match state {
            LifecycleState::PersistentNew | LifecycleState::PersistentDirty => {
                let page = home.get(&oid).ok_or_else(|| {
                    ObexError::corruption(format!("object {} has no packed record", oid))
                })?;
                let mut val = vec![0u8; 16];
                LittleEndian::write_u64(&mut val[0..8], *page);
                LittleEndian::write_u64(&mut val[8..16], new_version);
                primary = btree_insert(
                    txn,
                    primary,
                    EntryKey::primary(oid),
                    val,
                    InsertMode::Upsert,
                )?;
            }
            LifecycleState::PersistentDeleted => {
                let (new_root, _) = btree_remove(txn, primary, &EntryKey::primary(oid))?;
                primary = new_root;
            }
            _ => {}
        }
    }
    catalog.primary_root = primary;
    catalog.primary_epoch = new_version;

    // Полевые индексы: снятие старых записей по pre-image, вставка новых.
    for i in 0..catalog.indexes.len() {
        let (idx_name, unique, mut root) = {
            let d = &catalog.indexes[i];
            (d.name.clone(), d.unique, d.root)
        };
        let (class_name, field_name) = match idx_name.split_once('.') {
            Some(x) => x,
            None => {
                return Err(ObexError::corruption(format!(
                    "malformed index name {}",
                    idx_name
                )))
            }
        };
        let class_id = {
            let schemas = store
                .schemas
                .lock()
                .map_err(|_| ObexError::corruption("schema catalog poisoned"))?;
            schemas.class(class_name)?.class_id
        };
        let mode = if unique {
            InsertMode::UniqueStrict
        } else {
            InsertMode::NonUnique
        };
        let start_root = root;

        for (slot, state) in set {
            let oid = match slot {
                Slot::Oid(o) => *o,
                Slot::Transient(_) => continue,
            };
            let obj = match sess.cache.get(*slot) {
                Some(o) if o.class_id == class_id => o,
                _ => continue,
            };
            // Позиция поля в версии схемы ОБЪЕКТА; отсутствие = Null.
            let pos = sess
                .class_fields(class_id, obj.schema_ver)?
                .iter()
                .position(|f| f.name == field_name);
            let cur_val = pos.and_then(|p| obj.values.get(p)).cloned();
            let pre_val = pos.and_then(|p| {
                obj.pre_image
                    .as_ref()
                    .and_then(|img| img.get(p))
                    .cloned()
            });

            match state {
                LifecycleState::PersistentNew => {
                    if let Some(bytes) = cur_val.as_ref().map(field_key_bytes).transpose()?.flatten() {
                        root = btree_insert(txn, root, EntryKey::new(bytes, oid), Vec::new(), mode)?;
                    }
                }
                LifecycleState::PersistentDirty => {
                    let old_bytes = pre_val.as_ref().map(field_key_bytes).transpose()?.flatten();
                    let new_bytes = cur_val.as_ref().map(field_key_bytes).transpose()?.flatten();
                    if old_bytes == new_bytes {
                        continue;
                    }
                    if let Some(b) = old_bytes {
                        let (r, _) = btree_remove(txn, root, &EntryKey::new(b, oid))?;
                        root = r;
                    }
                    if let Some(b) = new_bytes {
                        root = btree_insert(txn, root, EntryKey::new(b, oid), Vec::new(), mode)?;
                    }
                }
                LifecycleState::PersistentDeleted => {
                    // Снимаем запись по закоммиченному образу: pre-image,
                    // если объект успели загрязнить до удаления.
                    let img_val = pre_val.as_ref().or(cur_val.as_ref());
                    if let Some(b) = img_val.map(field_key_bytes).transpose()?.flatten() {
                        let (r, _) = btree_remove(txn, root, &EntryKey::new(b, oid))?;
                        root = r;
                    }
                }
                _ => {}
            }
        }

        if root != start_root {
            catalog.indexes[i].root = root;
            catalog.indexes[i].epoch = new_version;
        }
    }
    Ok(())
}
