use anyhow::Result;
use std::path::PathBuf;

use ObexDB::codec::Value;
use ObexDB::config::ObexConfig;
use ObexDB::errors::ObexError;
use ObexDB::schema::{FieldDef, FieldKind};
use ObexDB::store::Store;

#[test]
fn second_committer_gets_conflict_with_oid() -> Result<()> {
    let root = unique_root("conflict");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut setup = store.session();
    setup.begin()?;
    let h = setup.new_object("T", vec![Value::I64(0)])?;
    let oid = setup.make_persistent(h)?;
    setup.commit()?;

    // A активирует запись (тег версии снят здесь).
    let mut a = store.session();
    a.begin()?;
    let ha = a.open(oid)?;
    a.set_field(ha, "v", Value::I64(1))?;

    // B коммитит свою правку того же OID первым.
    let mut b = store.session();
    b.begin()?;
    let hb = b.open(oid)?;
    b.set_field(hb, "v", Value::I64(2))?;
    b.commit()?;

    // A опаздывает: ConflictError с этим OID, dirty-набор не тронут.
    match a.commit() {
        Err(ObexError::Conflict { oids }) => assert_eq!(oids, vec![oid]),
        other => panic!("expected conflict, got {:?}", other),
    }

    // Повтор: откат, новая транзакция, та же правка проходит.
    a.rollback()?;
    a.begin()?;
    let ha = a.open(oid)?;
    assert_eq!(a.get_field(ha, "v")?, Value::I64(2));
    a.set_field(ha, "v", Value::I64(1))?;
    a.commit()?;

    let mut check = store.session();
    check.begin()?;
    let hc = check.open(oid)?;
    assert_eq!(check.get_field(hc, "v")?, Value::I64(1));
    check.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn conflict_list_accumulates_every_colliding_oid() -> Result<()> {
    let root = unique_root("conflict_multi");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut setup = store.session();
    setup.begin()?;
    let mut oids = Vec::new();
    for v in 0..3i64 {
        let h = setup.new_object("T", vec![Value::I64(v)])?;
        oids.push(setup.make_persistent(h)?);
    }
    setup.commit()?;

    let mut a = store.session();
    a.begin()?;
    for &oid in &oids {
        let h = a.open(oid)?;
        a.set_field(h, "v", Value::I64(100))?;
    }

    // B перезаписывает два из трёх.
    let mut b = store.session();
    b.begin()?;
    for &oid in &oids[0..2] {
        let h = b.open(oid)?;
        b.set_field(h, "v", Value::I64(200))?;
    }
    b.commit()?;

    match a.commit() {
        Err(ObexError::Conflict { oids: got }) => {
            let mut want = vec![oids[0], oids[1]];
            want.sort_unstable();
            assert_eq!(got, want, "conflict must list ALL colliding OIDs");
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn delete_under_foreign_delete_conflicts() -> Result<()> {
    let root = unique_root("conflict_del");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut setup = store.session();
    setup.begin()?;
    let h = setup.new_object("T", vec![Value::I64(1)])?;
    let oid = setup.make_persistent(h)?;
    setup.commit()?;

    let mut a = store.session();
    a.begin()?;
    let ha = a.open(oid)?;
    a.delete(ha)?;

    let mut b = store.session();
    b.begin()?;
    let hb = b.open(oid)?;
    b.delete(hb)?;
    b.commit()?;

    match a.commit() {
        Err(ObexError::Conflict { oids }) => assert_eq!(oids, vec![oid]),
        other => panic!("expected conflict, got {:?}", other),
    }

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
