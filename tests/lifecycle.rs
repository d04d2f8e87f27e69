use anyhow::Result;
use std::path::PathBuf;

use ObexDB::codec::Value;
use ObexDB::config::ObexConfig;
use ObexDB::errors::ObexError;
use ObexDB::schema::{FieldDef, FieldKind};
use ObexDB::store::Store;

fn open_store(root: &PathBuf) -> Result<Store> {
    Store::init(root, 4096)?;
    let store = Store::open(root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;
    Ok(store)
}

#[test]
fn double_delete_is_usage_error() -> Result<()> {
    let root = unique_root("dbl_del");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(9)])?;
    let oid = sess.make_persistent(h)?;
    sess.commit()?;

    sess.begin()?;
    let h = sess.open(oid)?;
    sess.delete(h)?;
    match sess.delete(h) {
        Err(ObexError::Usage(msg)) => assert!(msg.contains("already deleted")),
        other => panic!("expected usage error, got {:?}", other),
    }
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn activation_requires_transaction_and_owning_session() -> Result<()> {
    let root = unique_root("activation");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(1)])?;
    let oid = sess.make_persistent(h)?;
    sess.commit()?;

    // Вне транзакции поле недоступно.
    sess.begin()?;
    let h = sess.open(oid)?;
    sess.commit()?;
    match sess.get_field(h, "v") {
        Err(ObexError::Usage(msg)) => assert!(msg.contains("transaction")),
        other => panic!("expected usage error, got {:?}", other),
    }

    // Чужая сессия не принимает handle.
    let mut foreign = store.session();
    foreign.begin()?;
    match foreign.get_field(h, "v") {
        Err(ObexError::Usage(msg)) => assert!(msg.contains("foreign")),
        other => panic!("expected usage error, got {:?}", other),
    }
    foreign.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn evict_hollows_clean_and_reactivates_on_access() -> Result<()> {
    let root = unique_root("evict");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(5)])?;
    let oid = sess.make_persistent(h)?;
    sess.commit()?;

    sess.begin()?;
    let h = sess.open(oid)?;
    assert_eq!(sess.get_field(h, "v")?, Value::I64(5)); // Clean

    // Eviction отбрасывает данные, identity остаётся; доступ перечитывает.
    sess.evict(h)?;
    assert_eq!(sess.get_field(h, "v")?, Value::I64(5));

    // Dirty не вытесняется: правка переживает evict.
    sess.set_field(h, "v", Value::I64(6))?;
    sess.evict(h)?;
    assert_eq!(sess.get_field(h, "v")?, Value::I64(6));
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn transient_delete_and_new_deleted_never_hit_storage() -> Result<()> {
    let root = unique_root("transient");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;

    // Transient нельзя удалить: он не persistent.
    let t = sess.new_object("T", vec![Value::I64(1)])?;
    assert!(matches!(sess.delete(t), Err(ObexError::Usage(_))));

    // PersistentNew + delete до коммита: объект не попадает в хранилище.
    let oid = sess.make_persistent(t)?;
    sess.delete(t)?;
    sess.commit()?;

    sess.begin()?;
    assert!(matches!(sess.open(oid), Err(ObexError::NotFound(_))));
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn one_handle_per_oid_identity() -> Result<()> {
    let root = unique_root("identity");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(3)])?;
    let oid = sess.make_persistent(h)?;
    sess.commit()?;

    sess.begin()?;
    let h1 = sess.open(oid)?;
    let h2 = sess.open(oid)?;
    assert_eq!(h1, h2, "same OID must resolve to the same handle");

    // Правка через один handle видна через другой.
    sess.set_field(h1, "v", Value::I64(30))?;
    assert_eq!(sess.get_field(h2, "v")?, Value::I64(30));

    // Старый (transient) handle после make_persistent тоже эквивалентен.
    assert_eq!(sess.oid_of(h)?, oid);
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn closed_session_rejects_everything() -> Result<()> {
    let root = unique_root("closed");
    let store = open_store(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("T", vec![Value::I64(0)])?;
    sess.close();

    assert!(matches!(sess.begin(), Err(ObexError::Usage(_))));
    assert!(matches!(sess.get_field(h, "v"), Err(ObexError::Usage(_))));
    assert!(matches!(sess.commit(), Err(ObexError::Usage(_))));

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
