//! schema — версионированные, неизменяемые дескрипторы классов.
//!
//! Каталог хранится в sidecar-файле `schemas.json` рядом с данными.
//! Эволюция схемы append-only: повторное объявление класса с другим
//! набором полей добавляет НОВУЮ версию дескриптора, старые версии
//! остаются навсегда (объекты несут тег версии и читаются через неё).
//!
//! Запись каталога атомарна: tmp + rename + fsync каталога.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ObexError, Result};

pub const SCHEMAS_FILE: &str = "schemas.json";

/// Тип поля. Ref хранит голый OID и никогда не рекурсируется кодеком,
/// поэтому циклические графы объектов безопасны.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    I64,
    F64,
    Str,
    Bytes,
    Ref,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Одна версия дескриптора: упорядоченный список полей.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub class_id: u32,
    pub name: String,
    pub parent: Option<String>,
    pub versions: Vec<SchemaVersion>,
}

impl ClassDescriptor {
    /// Текущая (последняя) версия схемы класса.
    pub fn latest_version(&self) -> u16 {
        (self.versions.len() as u16).saturating_sub(1)
    }

    pub fn fields_at(&self, ver: u16) -> Result<&[FieldDef]> {
        self.versions
            .get(ver as usize)
            .map(|v| v.fields.as_slice())
            .ok_or_else(|| {
                ObexError::corruption(format!(
                    "class {} has no schema version {}",
                    self.name, ver
                ))
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub next_class_id: u32,
    /// name -> descriptor (BTreeMap ради детерминированного json).
    pub classes: BTreeMap<String, ClassDescriptor>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self {
            next_class_id: 1,
            classes: BTreeMap::new(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(SCHEMAS_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }
        let mut f = File::open(&path)?;
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        serde_json::from_str(&buf)
            .map_err(|e| ObexError::corruption(format!("{}: {}", SCHEMAS_FILE, e)))
    }

    /// Атомарная публикация каталога (tmp + rename + fsync dir).
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(SCHEMAS_FILE);
        let tmp: PathBuf = root.join(format!("{}.tmp", SCHEMAS_FILE));
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ObexError::corruption(format!("{} encode: {}", SCHEMAS_FILE, e)))?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if let Ok(dir) = File::open(root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Объявить (или доопределить) класс. Если класс уже существует и набор
    /// полей совпадает с последней версией, возвращается существующий тег;
    /// иначе добавляется новая версия. Смена родителя существующего класса
    /// не поддерживается.
    pub fn define_class(
        &mut self,
        name: &str,
        parent: Option<&str>,
        fields: Vec<FieldDef>,
    ) -> Result<(u32, u16)> {
        if let Some(p) = parent {
            if !self.classes.contains_key(p) {
                return Err(ObexError::usage(format!(
                    "parent class {} is not defined",
                    p
                )));
            }
        }
        if let Some(desc) = self.classes.get_mut(name) {
            if desc.parent.as_deref() != parent {
                return Err(ObexError::usage(format!(
                    "class {}: parent change is not supported",
                    name
                )));
            }
            let last = desc.latest_version();
            if desc.fields_at(last)? == fields.as_slice() {
                return Ok((desc.class_id, last));
            }
            desc.versions.push(SchemaVersion { fields });
            let ver = desc.latest_version();
            return Ok((desc.class_id, ver));
        }
        let class_id = self.next_class_id;
        self.next_class_id += 1;
        self.classes.insert(
            name.to_string(),
            ClassDescriptor {
                class_id,
                name: name.to_string(),
                parent: parent.map(str::to_string),
                versions: vec![SchemaVersion { fields }],
            },
        );
        Ok((class_id, 0))
    }

    pub fn class(&self, name: &str) -> Result<&ClassDescriptor> {
        self.classes
            .get(name)
            .ok_or_else(|| ObexError::usage(format!("class {} is not defined", name)))
    }

    pub fn class_by_id(&self, class_id: u32) -> Result<&ClassDescriptor> {
        self.classes
            .values()
            .find(|c| c.class_id == class_id)
            .ok_or_else(|| ObexError::corruption(format!("unknown class_id {}", class_id)))
    }

    /// id данного класса и всех его (транзитивных) подклассов.
    pub fn class_ids_with_subclasses(&self, name: &str) -> Result<Vec<u32>> {
        let base = self.class(name)?;
        let mut names = vec![base.name.clone()];
        let mut out = vec![base.class_id];
        // Иерархии мелкие, квадратичный проход приемлем.
        let mut i = 0;
        while i < names.len() {
            let cur = names[i].clone();
            for c in self.classes.values() {
                if c.parent.as_deref() == Some(cur.as_str()) {
                    names.push(c.name.clone());
                    out.push(c.class_id);
                }
            }
            i += 1;
        }
        out.sort_unstable();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "obexdb_{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn define_and_evolve_class() {
        let mut cat = SchemaCatalog::new();
        let (cid, v0) = cat
            .define_class("Person", None, vec![FieldDef::new("name", FieldKind::Str)])
            .unwrap();
        assert_eq!(v0, 0);

        // Идентичное переопределение не создаёт новую версию.
        let (cid2, v) = cat
            .define_class("Person", None, vec![FieldDef::new("name", FieldKind::Str)])
            .unwrap();
        assert_eq!((cid2, v), (cid, 0));

        // Добавление поля даёт версию 1; старая остаётся читаемой.
        let (_, v1) = cat
            .define_class(
                "Person",
                None,
                vec![
                    FieldDef::new("name", FieldKind::Str),
                    FieldDef::new("age", FieldKind::I64),
                ],
            )
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(cat.class("Person").unwrap().fields_at(0).unwrap().len(), 1);
        assert_eq!(cat.class("Person").unwrap().fields_at(1).unwrap().len(), 2);
    }

    #[test]
    fn subclass_resolution() {
        let mut cat = SchemaCatalog::new();
        let (a, _) = cat.define_class("A", None, vec![]).unwrap();
        let (b, _) = cat.define_class("B", Some("A"), vec![]).unwrap();
        let (c, _) = cat.define_class("C", Some("B"), vec![]).unwrap();
        let (_d, _) = cat.define_class("D", None, vec![]).unwrap();

        let mut want = vec![a, b, c];
        want.sort_unstable();
        assert_eq!(cat.class_ids_with_subclasses("A").unwrap(), want);
        assert_eq!(cat.class_ids_with_subclasses("C").unwrap(), vec![c]);
        assert!(cat.define_class("X", Some("nope"), vec![]).is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let root = temp_root("schema_rt");
        let mut cat = SchemaCatalog::new();
        cat.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])
            .unwrap();
        cat.save(&root).unwrap();

        let back = SchemaCatalog::load(&root).unwrap();
        assert_eq!(back.next_class_id, cat.next_class_id);
        assert_eq!(back.class("T").unwrap().class_id, cat.class("T").unwrap().class_id);
        fs::remove_dir_all(&root).unwrap();
    }
}
