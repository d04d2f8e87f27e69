use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use ObexDB::errors::ObexError;
use ObexDB::index::{
    btree_insert, btree_lookup, btree_remove, CowTxn, EntryKey, InsertMode, RangeCursor,
    MAX_ENTRY_PART_LEN,
};
use ObexDB::pager::Pager;
use ObexDB::store::Store;
use ObexDB::types::{PageId, NO_PAGE};

/// Рандомизированный прогон против модельного BTreeMap: вставки, апсерты,
/// удаления вперемешку; после каждой пачки полная сверка порядка обхода.
#[test]
fn randomized_churn_matches_model() -> Result<()> {
    let root = unique_root("churn");
    Store::init(&root, 4096)?;
    let mut pager = Pager::open(&root)?;
    pager.set_data_fsync(false);

    let mut rng = oorandom::Rand64::new(0xC0FFEE);
    let mut model: BTreeMap<(Vec<u8>, u64), Vec<u8>> = BTreeMap::new();
    let mut root_page: PageId = NO_PAGE;

    for round in 0..30u64 {
        let mut txn = CowTxn::new(&mut pager, round + 1, round + 1);
        for _ in 0..100 {
            let k = (rng.rand_u64() % 500).to_be_bytes().to_vec();
            let oid = 1 + rng.rand_u64() % 4;
            let key = EntryKey::new(k.clone(), oid);
            if rng.rand_u64() % 3 == 0 {
                let (nr, existed) = btree_remove(&mut txn, root_page, &key)?;
                root_page = nr;
                assert_eq!(existed, model.remove(&(k, oid)).is_some());
            } else {
                let val = (rng.rand_u64() % 1000).to_be_bytes().to_vec();
                root_page = btree_insert(
                    &mut txn,
                    root_page,
                    key,
                    val.clone(),
                    InsertMode::Upsert,
                )?;
                model.insert((k, oid), val);
            }
        }

        // Полная сверка: порядок и значения.
        let mut cur = RangeCursor::new(root_page, None, None, false);
        let mut walked = Vec::new();
        while let Some((k, v)) = cur.next(txn.pager)? {
            walked.push(((k.bytes, k.oid), v));
        }
        let expect: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(walked, expect, "round {}: tree must mirror the model", round);

        // Точечные lookup по выборке модели.
        for ((k, oid), v) in model.iter().take(20) {
            let got = btree_lookup(txn.pager, root_page, &EntryKey::new(k.clone(), *oid))?;
            assert_eq!(got.as_ref(), Some(v));
        }
    }

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

/// COW-изоляция на уровне дерева: старый корень продолжает отдавать прежнее
/// содержимое после любых правок, опубликованных через новый корень.
#[test]
fn old_root_is_immutable_after_updates() -> Result<()> {
    let root = unique_root("cow_iso");
    Store::init(&root, 4096)?;
    let mut pager = Pager::open(&root)?;
    pager.set_data_fsync(false);

    let mut tree: PageId = NO_PAGE;
    let mut txn = CowTxn::new(&mut pager, 1, 1);
    for i in 0..200u64 {
        tree = btree_insert(
            &mut txn,
            tree,
            EntryKey::new(i.to_be_bytes().to_vec(), i),
            b"v1".to_vec(),
            InsertMode::Upsert,
        )?;
    }
    let snapshot = tree;
    drop(txn);

    // Вторая "версия": половина ключей перезаписана, четверть удалена.
    // safe_before=1: ничего из первой версии реюзу не подлежит.
    let mut txn = CowTxn::new(&mut pager, 2, 1);
    for i in (0..200u64).step_by(2) {
        tree = btree_insert(
            &mut txn,
            tree,
            EntryKey::new(i.to_be_bytes().to_vec(), i),
            b"v2".to_vec(),
            InsertMode::Upsert,
        )?;
    }
    for i in (1..200u64).step_by(4) {
        let (nr, existed) =
            btree_remove(&mut txn, tree, &EntryKey::new(i.to_be_bytes().to_vec(), i))?;
        assert!(existed);
        tree = nr;
    }
    drop(txn);

    // Снапшот не изменился.
    let mut cur = RangeCursor::new(snapshot, None, None, false);
    let mut n = 0u64;
    while let Some((k, v)) = cur.next(&pager)? {
        assert_eq!(k.bytes, n.to_be_bytes().to_vec());
        assert_eq!(v, b"v1".to_vec());
        n += 1;
    }
    assert_eq!(n, 200);

    // Новый корень отражает правки.
    let got = btree_lookup(&pager, tree, &EntryKey::new(0u64.to_be_bytes().to_vec(), 0))?;
    assert_eq!(got, Some(b"v2".to_vec()));
    let gone = btree_lookup(&pager, tree, &EntryKey::new(1u64.to_be_bytes().to_vec(), 1))?;
    assert_eq!(gone, None);

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

/// Длины ключа и значения ограничены u16-полями кодировки листа. На большой
/// странице проверка байтовой ёмкости пропустила бы запись, чья длина
/// переполняет поле, и лист был бы молча испорчен.
#[test]
fn oversized_entry_rejected_at_insert() -> Result<()> {
    let root = unique_root("fatkey");
    Store::init(&root, 262_144)?;
    let mut pager = Pager::open(&root)?;
    pager.set_data_fsync(false);

    let mut txn = CowTxn::new(&mut pager, 1, 1);
    let tree = btree_insert(
        &mut txn,
        NO_PAGE,
        EntryKey::new(b"ok".to_vec(), 1),
        b"val".to_vec(),
        InsertMode::Upsert,
    )?;

    assert!(70_000 > MAX_ENTRY_PART_LEN);
    let fat = vec![7u8; 70_000];
    let err = btree_insert(
        &mut txn,
        tree,
        EntryKey::new(fat.clone(), 2),
        b"val".to_vec(),
        InsertMode::Upsert,
    )
    .unwrap_err();
    assert!(matches!(err, ObexError::Usage(_)), "got {:?}", err);

    let err = btree_insert(
        &mut txn,
        tree,
        EntryKey::new(b"k2".to_vec(), 3),
        vec![0u8; 70_000],
        InsertMode::Upsert,
    )
    .unwrap_err();
    assert!(matches!(err, ObexError::Usage(_)), "got {:?}", err);

    // Дерево не тронуто: старый ключ читается, оверсайз не появился.
    assert_eq!(
        btree_lookup(txn.pager, tree, &EntryKey::new(b"ok".to_vec(), 1))?,
        Some(b"val".to_vec())
    );
    assert_eq!(btree_lookup(txn.pager, tree, &EntryKey::new(fat, 2))?, None);

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
