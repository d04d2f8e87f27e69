//! session/cache — карта идентичности сессии и машина состояний объекта.
//!
//! Инвариант идентичности: на один OID в сессии существует РОВНО ОДНА
//! запись кэша (и значит один логический handle). Transient-объекты до
//! make_persistent живут под суррогатным слотом; после промоции слот
//! перенаправляется через таблицу promoted.
//!
//! Переходы (полный список, всё остальное — UsageError):
//!   Transient -> PersistentNew                 make_persistent
//!   PersistentNew -> PersistentClean           commit
//!   PersistentClean <-> PersistentDirty        write-активация / commit
//!   PersistentClean -> Hollow                  eviction
//!   Hollow -> PersistentClean                  read-активация
//!   Clean|Dirty|Hollow -> PersistentDeleted    delete
//!   PersistentNew -> PersistentNewDeleted      delete до первого коммита

use std::collections::HashMap;

use crate::codec::Value;
use crate::errors::{ObexError, Result};
use crate::metrics::record_eviction;
use crate::schema::{FieldDef, FieldKind};
use crate::types::{Oid, PageId, VersionId, NO_PAGE};

/// Слот кэша: настоящий OID либо суррогат transient-объекта.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Oid(Oid),
    Transient(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Transient,
    PersistentNew,
    PersistentClean,
    PersistentDirty,
    Hollow,
    PersistentDeleted,
    PersistentNewDeleted,
}

impl LifecycleState {
    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted
        )
    }
}

/// Режим активации поля.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct CachedObject {
    pub class_id: u32,
    pub schema_ver: u16,
    pub state: LifecycleState,
    /// Домашняя страница данных; NO_PAGE до первого коммита.
    pub home_page: PageId,
    /// Тег версии, прочитанный из primary-индекса при загрузке. Против него
    /// валидируется оптимистичный коммит.
    pub load_version: VersionId,
    /// Значения полей в порядке дескриптора schema_ver. Пусто в Hollow.
    pub values: Vec<Value>,
    /// Закоммиченный образ на момент первого загрязнения (для снятия старых
    /// индексных записей при коммите).
    pub pre_image: Option<Vec<Value>>,
}

#[derive(Default)]
pub struct ObjectCache {
    objects: HashMap<Slot, CachedObject>,
    /// Суррогат -> OID после make_persistent: старые handle продолжают работать.
    promoted: HashMap<u64, Oid>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Канонический слот (с учётом промоции transient-объектов).
    pub fn canonical(&self, slot: Slot) -> Slot {
        match slot {
            Slot::Transient(hid) => match self.promoted.get(&hid) {
                Some(oid) => Slot::Oid(*oid),
                None => slot,
            },
            s => s,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&CachedObject> {
        self.objects.get(&self.canonical(slot))
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut CachedObject> {
        let s = self.canonical(slot);
        self.objects.get_mut(&s)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.objects.contains_key(&self.canonical(slot))
    }

    pub fn insert(&mut self, slot: Slot, obj: CachedObject) {
        self.objects.insert(slot, obj);
    }

    pub fn remove(&mut self, slot: Slot) -> Option<CachedObject> {
        let s = self.canonical(slot);
        self.objects.remove(&s)
    }

    /// Промоция transient-объекта в PersistentNew под настоящим OID.
    pub fn promote(&mut self, hid: u64, oid: Oid) -> Result<()> {
        let mut obj = self
            .objects
            .remove(&Slot::Transient(hid))
            .ok_or_else(|| ObexError::usage("make_persistent: unknown transient handle"))?;
        if obj.state != LifecycleState::Transient {
            self.objects.insert(Slot::Transient(hid), obj);
            return Err(ObexError::usage(
                "make_persistent: handle is not in transient state",
            ));
        }
        obj.state = LifecycleState::PersistentNew;
        self.objects.insert(Slot::Oid(oid), obj);
        self.promoted.insert(hid, oid);
        Ok(())
    }

    /// Удаление через машину состояний. Повторное удаление — UsageError.
    pub fn mark_deleted(&mut self, slot: Slot) -> Result<()> {
        let s = self.canonical(slot);
        let obj = self
            .objects
            .get_mut(&s)
            .ok_or_else(|| ObexError::usage("delete: handle is not cached in this session"))?;
        match obj.state {
            LifecycleState::PersistentNew => {
                obj.state = LifecycleState::PersistentNewDeleted;
                Ok(())
            }
            LifecycleState::PersistentClean
            | LifecycleState::PersistentDirty
            | LifecycleState::Hollow => {
                obj.state = LifecycleState::PersistentDeleted;
                Ok(())
            }
            LifecycleState::Transient => Err(ObexError::usage(
                "delete: transient object was never made persistent",
            )),
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                Err(ObexError::usage("delete: object is already deleted"))
            }
        }
    }

    /// Вытеснение: только Clean -> Hollow. Dirty/New — no-op (несброшенные
    /// данные не теряем молча), остальные состояния не трогаем.
    pub fn evict(&mut self, slot: Slot, fields: &[FieldDef], retain_primitives: bool) {
        let s = self.canonical(slot);
        if let Some(obj) = self.objects.get_mut(&s) {
            if obj.state != LifecycleState::PersistentClean {
                return;
            }
            if retain_primitives {
                for (fd, v) in fields.iter().zip(obj.values.iter_mut()) {
                    if matches!(fd.kind, FieldKind::Ref | FieldKind::List) {
                        *v = Value::Null;
                    }
                }
            } else {
                obj.values.clear();
            }
            obj.pre_image = None;
            obj.state = LifecycleState::Hollow;
            record_eviction();
        }
    }

    /// Слоты, участвующие в коммите (new / dirty / deleted).
    pub fn commit_set(&self) -> Vec<(Slot, LifecycleState)> {
        let mut out: Vec<(Slot, LifecycleState)> = self
            .objects
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o.state,
                    LifecycleState::PersistentNew
                        | LifecycleState::PersistentDirty
                        | LifecycleState::PersistentDeleted
                        | LifecycleState::PersistentNewDeleted
                )
            })
            .map(|(s, o)| (*s, o.state))
            .collect();
        // Детерминированный порядок обработки.
        out.sort_by_key(|(s, _)| match *s {
            Slot::Oid(oid) => (0u8, oid),
            Slot::Transient(h) => (1u8, h),
        });
        out
    }

    /// OID удалённых в этой транзакции (для фильтрации итераторов).
    pub fn deleted_oids(&self) -> Vec<Oid> {
        self.objects
            .iter()
            .filter_map(|(s, o)| match (s, o.state) {
                (Slot::Oid(oid), LifecycleState::PersistentDeleted) => Some(*oid),
                _ => None,
            })
            .collect()
    }

    /// Откат: несохранённое отбрасывается, persistent-объекты опустошаются
    /// до Hollow (перечитаются при следующем доступе).
    pub fn rollback(&mut self) {
        self.objects.retain(|_, o| {
            !matches!(
                o.state,
                LifecycleState::PersistentNew | LifecycleState::PersistentNewDeleted
            )
        });
        for o in self.objects.values_mut() {
            match o.state {
                LifecycleState::PersistentDirty | LifecycleState::PersistentDeleted => {
                    o.values.clear();
                    o.pre_image = None;
                    o.state = LifecycleState::Hollow;
                }
                _ => {}
            }
        }
    }

    /// Пост-коммитный переход всех участников.
    pub fn after_commit(
        &mut self,
        new_version: VersionId,
        home_pages: &HashMap<Oid, PageId>,
    ) {
        let mut gone: Vec<Slot> = Vec::new();
        for (s, o) in self.objects.iter_mut() {
            match o.state {
                LifecycleState::PersistentNew | LifecycleState::PersistentDirty => {
                    o.state = LifecycleState::PersistentClean;
                    o.load_version = new_version;
                    o.pre_image = None;
                    if let Slot::Oid(oid) = s {
                        if let Some(pg) = home_pages.get(oid) {
                            o.home_page = *pg;
                        }
                    }
                }
                LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                    gone.push(*s);
                }
                _ => {}
            }
        }
        for s in gone {
            self.objects.remove(&s);
        }
    }

    /// Все слоты с их состояниями (для пост-коммитных политик).
    pub fn snapshot_states(&self) -> Vec<(Slot, LifecycleState)> {
        self.objects.iter().map(|(s, o)| (*s, o.state)).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient_obj() -> CachedObject {
        CachedObject {
            class_id: 1,
            schema_ver: 0,
            state: LifecycleState::Transient,
            home_page: NO_PAGE,
            load_version: 0,
            values: vec![Value::I64(1)],
            pre_image: None,
        }
    }

    #[test]
    fn promote_redirects_old_slot() {
        let mut c = ObjectCache::new();
        c.insert(Slot::Transient(7), transient_obj());
        c.promote(7, 100).unwrap();
        // Старый слот по-прежнему резолвится в тот же объект.
        assert_eq!(
            c.get(Slot::Transient(7)).unwrap().state,
            LifecycleState::PersistentNew
        );
        assert!(c.get(Slot::Oid(100)).is_some());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn double_delete_is_usage_error() {
        let mut c = ObjectCache::new();
        let mut o = transient_obj();
        o.state = LifecycleState::PersistentClean;
        c.insert(Slot::Oid(9), o);
        c.mark_deleted(Slot::Oid(9)).unwrap();
        let err = c.mark_deleted(Slot::Oid(9)).unwrap_err();
        assert!(matches!(err, ObexError::Usage(_)));
    }

    #[test]
    fn new_deleted_never_reaches_commit_storage() {
        let mut c = ObjectCache::new();
        c.insert(Slot::Transient(1), transient_obj());
        c.promote(1, 5).unwrap();
        c.mark_deleted(Slot::Oid(5)).unwrap();
        assert_eq!(
            c.get(Slot::Oid(5)).unwrap().state,
            LifecycleState::PersistentNewDeleted
        );
        c.after_commit(2, &HashMap::new());
        assert!(c.get(Slot::Oid(5)).is_none());
    }

    #[test]
    fn evict_skips_dirty() {
        let mut c = ObjectCache::new();
        let mut o = transient_obj();
        o.state = LifecycleState::PersistentDirty;
        c.insert(Slot::Oid(3), o);
        c.evict(Slot::Oid(3), &[], false);
        assert_eq!(c.get(Slot::Oid(3)).unwrap().state, LifecycleState::PersistentDirty);
        assert!(!c.get(Slot::Oid(3)).unwrap().values.is_empty());
    }

    #[test]
    fn rollback_hollows_dirty_and_drops_new() {
        let mut c = ObjectCache::new();
        let mut dirty = transient_obj();
        dirty.state = LifecycleState::PersistentDirty;
        dirty.pre_image = Some(vec![Value::I64(0)]);
        c.insert(Slot::Oid(1), dirty);
        c.insert(Slot::Transient(2), transient_obj());
        c.promote(2, 10).unwrap();

        c.rollback();
        let o = c.get(Slot::Oid(1)).unwrap();
        assert_eq!(o.state, LifecycleState::Hollow);
        assert!(o.values.is_empty() && o.pre_image.is_none());
        assert!(c.get(Slot::Oid(10)).is_none());
    }
}
