use anyhow::Result;
use std::path::PathBuf;

use ObexDB::codec::Value;
use ObexDB::config::ObexConfig;
use ObexDB::errors::ObexError;
use ObexDB::meta::read_meta;
use ObexDB::schema::{FieldDef, FieldKind};
use ObexDB::store::Store;

#[test]
fn smoke_init_create_commit_read_delete() -> Result<()> {
    let root = unique_root("smoke");

    // 1) init
    let page_size = 64 * 1024;
    Store::init(&root, page_size)?;

    let oid;
    {
        let store = Store::open(&root, ObexConfig::default())?;
        store.define_class(
            "Person",
            None,
            vec![
                FieldDef::new("name", FieldKind::Str),
                FieldDef::new("age", FieldKind::I64),
            ],
        )?;

        // 2) создать и закоммитить объект
        let mut sess = store.session();
        sess.begin()?;
        let h = sess.new_object(
            "Person",
            vec![Value::Str("alice".into()), Value::I64(33)],
        )?;
        oid = sess.make_persistent(h)?;
        sess.commit()?;

        // 3) прочитать в новой транзакции (handle тот же, объект Clean)
        sess.begin()?;
        let h2 = sess.open(oid)?;
        assert_eq!(sess.get_field(h2, "name")?, Value::Str("alice".into()));
        assert_eq!(sess.get_field(h2, "age")?, Value::I64(33));

        // 4) обновить и перечитать из другой сессии
        sess.set_field(h2, "age", Value::I64(34))?;
        sess.commit()?;

        let mut other = store.session();
        other.begin()?;
        let ho = other.open(oid)?;
        assert_eq!(other.get_field(ho, "age")?, Value::I64(34));
        other.rollback()?;

        // 5) удалить и убедиться в NotFound
        sess.begin()?;
        let hd = sess.open(oid)?;
        sess.delete(hd)?;
        sess.commit()?;

        sess.begin()?;
        match sess.open(oid) {
            Err(ObexError::NotFound(o)) => assert_eq!(o, oid),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
        sess.rollback()?;
    }

    // 6) после Drop стора meta фиксирует чистое завершение
    let m = read_meta(&root)?;
    assert_eq!(m.page_size, page_size);
    assert!(m.clean_shutdown, "store drop must mark clean shutdown");
    assert!(m.committed_version >= 3);
    assert!(m.next_oid > oid);

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn reopen_preserves_committed_state() -> Result<()> {
    let root = unique_root("reopen");
    Store::init(&root, 4096)?;

    let oid;
    {
        let store = Store::open(&root, ObexConfig::default())?;
        store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;
        let mut sess = store.session();
        sess.begin()?;
        let h = sess.new_object("T", vec![Value::I64(7)])?;
        oid = sess.make_persistent(h)?;
        sess.commit()?;
    }

    // Второе открытие: состояние и счётчики на месте.
    {
        let store = Store::open(&root, ObexConfig::default())?;
        let mut sess = store.session();
        sess.begin()?;
        let h = sess.open(oid)?;
        assert_eq!(sess.get_field(h, "v")?, Value::I64(7));
        sess.rollback()?;

        // OID монотонны и не переиспользуются между открытиями.
        sess.begin()?;
        let h2 = sess.new_object("T", vec![Value::I64(8)])?;
        let oid2 = sess.make_persistent(h2)?;
        assert!(oid2 > oid);
        sess.commit()?;
    }

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn rollback_leaves_storage_untouched() -> Result<()> {
    let root = unique_root("rollback");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(1)])?;
    let oid = sess.make_persistent(h)?;
    sess.commit()?;

    let before = read_meta(&root)?.committed_version;

    sess.begin()?;
    let h = sess.open(oid)?;
    sess.set_field(h, "v", Value::I64(99))?;
    sess.rollback()?;

    // Версия не сдвинулась, значение прежнее.
    assert_eq!(read_meta(&root)?.committed_version, before);
    sess.begin()?;
    let h = sess.open(oid)?;
    assert_eq!(sess.get_field(h, "v")?, Value::I64(1));
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("obx-{}-{}-{}", prefix, pid, t))
}
