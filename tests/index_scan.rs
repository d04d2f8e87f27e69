use anyhow::Result;
use std::path::PathBuf;

use ObexDB::codec::Value;
use ObexDB::config::ObexConfig;
use ObexDB::query::{CmpOp, OrderBy, Predicate, Query, RangeHint};
use ObexDB::schema::{FieldDef, FieldKind};
use ObexDB::store::Store;
use ObexDB::types::Oid;

fn setup_five(root: &PathBuf) -> Result<(Store, Vec<Oid>)> {
    Store::init(root, 4096)?;
    let store = Store::open(root, ObexConfig::default())?;
    store.define_class("T", None, vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut sess = store.session();
    sess.begin()?;
    let mut oids = Vec::new();
    for v in 1..=5i64 {
        let h = sess.new_object("T", vec![Value::I64(v)])?;
        oids.push(sess.make_persistent(h)?);
    }
    sess.commit()?;
    store.create_index("T", "v", true)?;
    Ok((store, oids))
}

#[test]
fn range_query_v_ge_3_returns_345_ascending() -> Result<()> {
    let root = unique_root("range");
    let (store, _) = setup_five(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    let q = Query {
        class: "T".into(),
        include_subclasses: false,
        predicate: Predicate::Cmp {
            field: "v".into(),
            op: CmpOp::Ge,
            value: Value::I64(3),
        },
        hint: Some(RangeHint {
            field: "v".into(),
            op: CmpOp::Ge,
            key: Value::I64(3),
        }),
        order_by: None,
    };
    let hits = sess.query(&q)?;
    let vals: Vec<Value> = hits
        .iter()
        .map(|h| sess.get_field(*h, "v"))
        .collect::<ObexDB::Result<_>>()?;
    assert_eq!(vals, vec![Value::I64(3), Value::I64(4), Value::I64(5)]);
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn descending_order_and_exact_match() -> Result<()> {
    let root = unique_root("range_desc");
    let (store, _) = setup_five(&root)?;

    let mut sess = store.session();
    sess.begin()?;

    // Точное совпадение через индекс.
    let q_eq = Query {
        class: "T".into(),
        include_subclasses: false,
        predicate: Predicate::True,
        hint: Some(RangeHint {
            field: "v".into(),
            op: CmpOp::Eq,
            key: Value::I64(2),
        }),
        order_by: None,
    };
    let hits = sess.query(&q_eq)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(sess.get_field(hits[0], "v")?, Value::I64(2));

    // Убывающий порядок: материализация-сортировка без подсказки.
    let q_desc = Query {
        class: "T".into(),
        include_subclasses: false,
        predicate: Predicate::Cmp {
            field: "v".into(),
            op: CmpOp::Le,
            value: Value::I64(4),
        },
        hint: None,
        order_by: Some(OrderBy {
            field: "v".into(),
            descending: true,
        }),
    };
    let hits = sess.query(&q_desc)?;
    let vals: Vec<Value> = hits
        .iter()
        .map(|h| sess.get_field(*h, "v"))
        .collect::<ObexDB::Result<_>>()?;
    assert_eq!(
        vals,
        vec![Value::I64(4), Value::I64(3), Value::I64(2), Value::I64(1)]
    );
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn index_follows_updates_and_deletes() -> Result<()> {
    let root = unique_root("index_upd");
    let (store, oids) = setup_five(&root)?;

    let mut sess = store.session();
    sess.begin()?;
    // v:2 -> 20, v:5 удаляем.
    let h2 = sess.open(oids[1])?;
    sess.set_field(h2, "v", Value::I64(20))?;
    let h5 = sess.open(oids[4])?;
    sess.delete(h5)?;
    sess.commit()?;

    sess.begin()?;
    let q = Query {
        class: "T".into(),
        include_subclasses: false,
        predicate: Predicate::Cmp {
            field: "v".into(),
            op: CmpOp::Ge,
            value: Value::I64(3),
        },
        hint: Some(RangeHint {
            field: "v".into(),
            op: CmpOp::Ge,
            key: Value::I64(3),
        }),
        order_by: None,
    };
    let hits = sess.query(&q)?;
    let vals: Vec<Value> = hits
        .iter()
        .map(|h| sess.get_field(*h, "v"))
        .collect::<ObexDB::Result<_>>()?;
    // Старая запись v=2 снята, v=5 удалена, v=20 добавлена.
    assert_eq!(vals, vec![Value::I64(3), Value::I64(4), Value::I64(20)]);
    sess.rollback()?;

    // Снос индекса: запрос уходит в полный скан и даёт тот же результат.
    store.remove_index("T", "v")?;
    sess.begin()?;
    let hits = sess.query(&q)?;
    let mut vals: Vec<Value> = hits
        .iter()
        .map(|h| sess.get_field(*h, "v"))
        .collect::<ObexDB::Result<_>>()?;
    vals.sort_by(|a, b| ObexDB::query::cmp_values(a, b).unwrap());
    assert_eq!(vals, vec![Value::I64(3), Value::I64(4), Value::I64(20)]);
    sess.rollback()?;

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

/// Индекс точен по классу, поэтому запрос с подклассами собирает кандидатов
/// экстентом: индексная подсказка не должна терять экземпляры потомков.
#[test]
fn subclass_query_with_hint_keeps_children() -> Result<()> {
    let root = unique_root("subq");
    Store::init(&root, 4096)?;
    let store = Store::open(&root, ObexConfig::default())?;
    store.define_class("Base", None, vec![FieldDef::new("v", FieldKind::I64)])?;
    store.define_class("Child", Some("Base"), vec![FieldDef::new("v", FieldKind::I64)])?;

    let mut sess = store.session();
    sess.begin()?;
    let hb = sess.new_object("Base", vec![Value::I64(5)])?;
    let ob = sess.make_persistent(hb)?;
    let hc = sess.new_object("Child", vec![Value::I64(7)])?;
    let oc = sess.make_persistent(hc)?;
    sess.commit()?;
    store.create_index("Base", "v", false)?;

    sess.begin()?;
    let q = Query {
        class: "Base".into(),
        include_subclasses: true,
        predicate: Predicate::Cmp {
            field: "v".into(),
            op: CmpOp::Ge,
            value: Value::I64(1),
        },
        hint: Some(RangeHint {
            field: "v".into(),
            op: CmpOp::Ge,
            key: Value::I64(1),
        }),
        order_by: None,
    };
    let hits = sess.query(&q)?;
    let mut got: Vec<Oid> = hits
        .iter()
        .map(|h| sess.oid_of(*h))
        .collect::<ObexDB::Result<_>>()?;
    got.sort_unstable();
    assert_eq!(got, vec![ob, oc], "child instance must survive the hint");

    // Без подклассов подсказка работает как раньше: только Base.
    let q_exact = Query {
        include_subclasses: false,
        ..q
    };
    let hits = sess.query(&q_exact)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(sess.oid_of(hits[0])?, ob);
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
