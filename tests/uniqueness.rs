use anyhow::Result;
use std::path::PathBuf;

use ObexDB::codec::Value;
use ObexDB::config::ObexConfig;
use ObexDB::errors::ObexError;
use ObexDB::schema::{FieldDef, FieldKind};
use ObexDB::store::Store;

#[test]
fn duplicate_key_in_unique_index_fails_commit() -> Result<()> {
    let root = unique_root("uniq_commit");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("U", None, vec![FieldDef::new("email", FieldKind::Str)])?;

    let mut sess = store.session();
    sess.begin()?;
    let h = sess.new_object("U", vec![Value::Str("a@x".into())])?;
    sess.make_persistent(h)?;
    sess.commit()?;
    store.create_index("U", "email", true)?;

    // Второй объект с тем же ключом: ConstraintError на коммите,
    // ничего не публикуется.
    sess.begin()?;
    let dup = sess.new_object("U", vec![Value::Str("a@x".into())])?;
    sess.make_persistent(dup)?;
    match sess.commit() {
        Err(ObexError::Constraint(_)) => {}
        other => panic!("expected constraint violation, got {:?}", other),
    }
    sess.rollback()?;

    // Другой ключ проходит.
    sess.begin()?;
    let ok = sess.new_object("U", vec![Value::Str("b@x".into())])?;
    sess.make_persistent(ok)?;
    sess.commit()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn unique_index_over_duplicate_data_is_rejected() -> Result<()> {
    let root = unique_root("uniq_build");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("U", None, vec![FieldDef::new("email", FieldKind::Str)])?;

    let mut sess = store.session();
    sess.begin()?;
    for _ in 0..2 {
        let h = sess.new_object("U", vec![Value::Str("same@x".into())])?;
        sess.make_persistent(h)?;
    }
    sess.commit()?;

    match store.create_index("U", "email", true) {
        Err(ObexError::Constraint(_)) => {}
        other => panic!("expected constraint violation, got {:?}", other),
    }
    // Неуникальный индекс над теми же данными строится.
    store.create_index("U", "email", false)?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn update_to_taken_key_fails_update_to_free_key_passes() -> Result<()> {
    let root = unique_root("uniq_update");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("U", None, vec![FieldDef::new("k", FieldKind::I64)])?;

    let mut sess = store.session();
    sess.begin()?;
    let h1 = sess.new_object("U", vec![Value::I64(1)])?;
    let o1 = sess.make_persistent(h1)?;
    let h2 = sess.new_object("U", vec![Value::I64(2)])?;
    sess.make_persistent(h2)?;
    sess.commit()?;
    store.create_index("U", "k", true)?;

    sess.begin()?;
    let h = sess.open(o1)?;
    sess.set_field(h, "k", Value::I64(2))?;
    assert!(matches!(sess.commit(), Err(ObexError::Constraint(_))));
    sess.rollback()?;

    sess.begin()?;
    let h = sess.open(o1)?;
    sess.set_field(h, "k", Value::I64(3))?;
    sess.commit()?;

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
