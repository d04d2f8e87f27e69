//! index/btree — COW B+Tree: точечный поиск, вставка, удаление, seek.
//!
//! Дисциплина COW: любая страница на пути вставки/удаления копируется на
//! новый page_id (path copying), включая корень; страницы старого корня не
//! изменяются никогда — читатели, привязанные к прежней версии, продолжают
//! видеть согласованное дерево.
//!
//! Разделители внутренних страниц всегда РАВНЫ минимальному ключу правого
//! поддерева (рекурсия возвращает новый минимум, родитель обновляет
//! разделитель). Это упрощает и спуск, и проверку уникальности.
//!
//! Уникальные индексы: спуск для вставки сравнивает разделители ТОЛЬКО по
//! байтам ключа (без OID tie-break), поэтому существующая запись с теми же
//! байтами обнаруживается в том же самом спуске — отдельного lookup нет.
//!
//! Ребаланс при удалении минимальный: пустой узел выбрасывается из родителя,
//! корень из одного ребёнка схлопывается. Полузаполненные узлы не сливаются.

use std::cmp::Ordering;

use crate::errors::{ObexError, Result};
use crate::metrics::record_btree_split;
use crate::page::node::{LeafEntry, Node};
use crate::pager::Pager;
use crate::types::{PageId, NO_PAGE};

use super::cow::CowTxn;
use super::key::EntryKey;

/// Предел длины ключа и значения одной записи: u16-поля кодировки листа.
/// Проверяется на входе вставки, а не ёмкостью страницы — при больших
/// страницах fits() пропустил бы запись, чьи длины переполняют поле.
pub const MAX_ENTRY_PART_LEN: usize = u16::MAX as usize;

/// Режим вставки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Полный ключ (bytes, oid); существующая пара заменяет значение.
    /// Используется первичным индексом (bytes == BE(oid)).
    Upsert,
    /// Уникальный индекс: те же байты ключа у ДРУГОГО OID — Constraint.
    UniqueStrict,
    /// Неуникальный индекс: пары (key, oid) различимы, дубликат пары — замена.
    NonUnique,
}

#[inline]
fn read_node(pager: &Pager, pid: PageId) -> Result<Node> {
    let mut buf = vec![0u8; pager.page_size()];
    pager.read_page(pid, &mut buf)?;
    Node::decode(&buf, pid)
}

/// Сравнение для спуска: уникальные индексы сравнивают только байты.
#[inline]
fn descent_cmp(a: &EntryKey, b: &EntryKey, bytes_only: bool) -> Ordering {
    if bytes_only {
        a.bytes.cmp(&b.bytes)
    } else {
        a.cmp(b)
    }
}

/// Индекс ребёнка для ключа: первый ребёнок, диапазон которого может
/// содержать ключ (разделитель s «уводит вправо», если s <= key).
#[inline]
fn child_index(keys: &[EntryKey], key: &EntryKey, bytes_only: bool) -> usize {
    keys.iter()
        .take_while(|s| descent_cmp(s, key, bytes_only) != Ordering::Greater)
        .count()
}

// ---------------------------------------------------------------------------
// Вставка
// ---------------------------------------------------------------------------

enum InsertUp {
    /// Узел переписан на новую страницу.
    Single(PageId),
    /// Узел разделён: (левая, минимальный ключ правой, правая).
    Split(PageId, EntryKey, PageId),
}

struct InsertDown {
    up: InsertUp,
    /// Новый минимум поддерева, если он изменился (для обновления разделителя).
    new_min: Option<EntryKey>,
}

/// Вставить (key -> val). Возвращает новый корень.
pub fn btree_insert(
    txn: &mut CowTxn<'_>,
    root: PageId,
    key: EntryKey,
    val: Vec<u8>,
    mode: InsertMode,
) -> Result<PageId> {
    if key.bytes.len() > MAX_ENTRY_PART_LEN || val.len() > MAX_ENTRY_PART_LEN {
        return Err(ObexError::usage(format!(
            "index entry too large: key {} bytes, value {} bytes (limit {})",
            key.bytes.len(),
            val.len(),
            MAX_ENTRY_PART_LEN
        )));
    }
    if root == NO_PAGE {
        let node = Node::Leaf(vec![LeafEntry { key, val }]);
        return txn.write_node(&node);
    }

    let down = insert_rec(txn, root, key, val, mode)?;
    match down.up {
        InsertUp::Single(pid) => Ok(pid),
        InsertUp::Split(left, sep, right) => {
            record_btree_split();
            let new_root = Node::Inner {
                keys: vec![sep],
                children: vec![left, right],
            };
            txn.write_node(&new_root)
        }
    }
}

fn insert_rec(
    txn: &mut CowTxn<'_>,
    pid: PageId,
    key: EntryKey,
    val: Vec<u8>,
    mode: InsertMode,
) -> Result<InsertDown> {
    let node = read_node(txn.pager, pid)?;
    let bytes_only = mode == InsertMode::UniqueStrict;

    match node {
        Node::Leaf(mut entries) => {
            // Точка вставки по полному ключу.
            let pos = entries
                .iter()
                .take_while(|e| e.key < key)
                .count();

            if mode == InsertMode::UniqueStrict {
                // Запись с теми же байтами ключа ищем вокруг точки вставки;
                // благодаря bytes-only спуску она обязана быть в этом листе.
                let dup = entries
                    .iter()
                    .find(|e| e.key.bytes == key.bytes && e.key.oid != key.oid);
                if let Some(e) = dup {
                    return Err(ObexError::constraint(format!(
                        "unique index violation: key already mapped to OID {} (inserting OID {})",
                        e.key.oid, key.oid
                    )));
                }
            }

            if pos < entries.len() && entries[pos].key == key {
                // Та же пара (key, oid) — замена значения.
                entries[pos].val = val;
            } else {
                entries.insert(pos, LeafEntry { key, val });
            }

            finish_leaf(txn, pid, entries, pos == 0)
        }
        Node::Inner { mut keys, mut children } => {
            let idx = child_index(&keys, &key, bytes_only);
            let down = insert_rec(txn, children[idx], key, val, mode)?;

            // Обновление разделителя при смене минимума ребёнка.
            let mut new_min = None;
            if let Some(min) = down.new_min {
                if idx > 0 {
                    keys[idx - 1] = min;
                } else {
                    new_min = Some(min);
                }
            }

            match down.up {
                InsertUp::Single(child_pid) => {
                    children[idx] = child_pid;
                }
                InsertUp::Split(left, sep, right) => {
                    record_btree_split();
                    children[idx] = left;
                    children.insert(idx + 1, right);
                    keys.insert(idx, sep);
                }
            }

            finish_inner(txn, pid, keys, children, new_min)
        }
    }
}

fn finish_leaf(
    txn: &mut CowTxn<'_>,
    old_pid: PageId,
    entries: Vec<LeafEntry>,
    min_changed: bool,
) -> Result<InsertDown> {
    let ps = txn.page_size();
    let node = Node::Leaf(entries);
    txn.free(old_pid);

    if node.fits(ps) {
        let new_min = if min_changed {
            match &node {
                Node::Leaf(es) => Some(es[0].key.clone()),
                _ => unreachable!(),
            }
        } else {
            None
        };
        let pid = txn.write_node(&node)?;
        return Ok(InsertDown {
            up: InsertUp::Single(pid),
            new_min,
        });
    }

    // Split пополам по числу записей.
    let entries = match node {
        Node::Leaf(es) => es,
        _ => unreachable!(),
    };
    let mid = entries.len() / 2;
    let right_entries = entries[mid..].to_vec();
    let left_entries = entries[..mid].to_vec();
    let sep = right_entries[0].key.clone();
    let new_min = if min_changed {
        Some(left_entries[0].key.clone())
    } else {
        None
    };
    let left = txn.write_node(&Node::Leaf(left_entries))?;
    let right = txn.write_node(&Node::Leaf(right_entries))?;
    Ok(InsertDown {
        up: InsertUp::Split(left, sep, right),
        new_min,
    })
}

fn finish_inner(
    txn: &mut CowTxn<'_>,
    old_pid: PageId,
    keys: Vec<EntryKey>,
    children: Vec<PageId>,
    new_min: Option<EntryKey>,
) -> Result<InsertDown> {
    let ps = txn.page_size();
    let node = Node::Inner { keys, children };
    txn.free(old_pid);

    if node.fits(ps) {
        let pid = txn.write_node(&node)?;
        return Ok(InsertDown {
            up: InsertUp::Single(pid),
            new_min,
        });
    }

    let (keys, children) = match node {
        Node::Inner { keys, children } => (keys, children),
        _ => unreachable!(),
    };
    // children: c0..cn, keys: k0..k(n-1). Разрез по середине детей;
    // keys[mid-1] поднимается наверх как разделитель.
    let mid = children.len() / 2;
    let left_node = Node::Inner {
        keys: keys[..mid - 1].to_vec(),
        children: children[..mid].to_vec(),
    };
    let promoted = keys[mid - 1].clone();
    let right_node = Node::Inner {
        keys: keys[mid..].to_vec(),
        children: children[mid..].to_vec(),
    };
    let left = txn.write_node(&left_node)?;
    let right = txn.write_node(&right_node)?;
    Ok(InsertDown {
        up: InsertUp::Split(left, promoted, right),
        new_min,
    })
}

// ---------------------------------------------------------------------------
// Удаление
// ---------------------------------------------------------------------------

enum RemoveUp {
    /// Ключа нет; дерево не тронуто.
    NotFound,
    /// Узел переписан (None — узел опустел и выброшен).
    Changed {
        new_page: Option<PageId>,
        new_min: Option<EntryKey>,
    },
}

/// Удалить пару (key, oid). Возвращает (новый корень, удалялось ли что-то).
pub fn btree_remove(
    txn: &mut CowTxn<'_>,
    root: PageId,
    key: &EntryKey,
) -> Result<(PageId, bool)> {
    if root == NO_PAGE {
        return Ok((root, false));
    }
    match remove_rec(txn, root, key)? {
        RemoveUp::NotFound => Ok((root, false)),
        RemoveUp::Changed { new_page, .. } => match new_page {
            None => Ok((NO_PAGE, true)),
            Some(pid) => {
                // Схлопнуть корень из одного ребёнка.
                let node = read_node(txn.pager, pid)?;
                if let Node::Inner { children, .. } = &node {
                    if children.len() == 1 {
                        let only = children[0];
                        txn.free(pid);
                        return Ok((only, true));
                    }
                }
                Ok((pid, true))
            }
        },
    }
}

fn remove_rec(txn: &mut CowTxn<'_>, pid: PageId, key: &EntryKey) -> Result<RemoveUp> {
    let node = read_node(txn.pager, pid)?;
    match node {
        Node::Leaf(mut entries) => {
            let pos = match entries.iter().position(|e| e.key == *key) {
                Some(p) => p,
                None => return Ok(RemoveUp::NotFound),
            };
            entries.remove(pos);
            txn.free(pid);
            if entries.is_empty() {
                return Ok(RemoveUp::Changed {
                    new_page: None,
                    new_min: None,
                });
            }
            let new_min = if pos == 0 {
                Some(entries[0].key.clone())
            } else {
                None
            };
            let new_pid = txn.write_node(&Node::Leaf(entries))?;
            Ok(RemoveUp::Changed {
                new_page: Some(new_pid),
                new_min,
            })
        }
        Node::Inner { mut keys, mut children } => {
            let idx = child_index(&keys, key, false);
            match remove_rec(txn, children[idx], key)? {
                RemoveUp::NotFound => Ok(RemoveUp::NotFound),
                RemoveUp::Changed { new_page, new_min } => {
                    txn.free(pid);
                    let mut propagate_min = None;

                    match new_page {
                        Some(child_pid) => {
                            children[idx] = child_pid;
                            if let Some(min) = new_min {
                                if idx > 0 {
                                    keys[idx - 1] = min;
                                } else {
                                    propagate_min = Some(min);
                                }
                            }
                        }
                        None => {
                            // Ребёнок опустел: выбрасываем его и разделитель.
                            children.remove(idx);
                            if children.is_empty() {
                                return Ok(RemoveUp::Changed {
                                    new_page: None,
                                    new_min: None,
                                });
                            }
                            if idx > 0 {
                                keys.remove(idx - 1);
                            } else {
                                // Новый минимум поддерева — бывший первый разделитель.
                                propagate_min = Some(keys.remove(0));
                            }
                        }
                    }

                    let new_pid = txn.write_node(&Node::Inner { keys, children })?;
                    Ok(RemoveUp::Changed {
                        new_page: Some(new_pid),
                        new_min: propagate_min,
                    })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Чтение
// ---------------------------------------------------------------------------

/// Точное значение по (key, oid).
pub fn btree_lookup(pager: &Pager, root: PageId, key: &EntryKey) -> Result<Option<Vec<u8>>> {
    if root == NO_PAGE {
        return Ok(None);
    }
    let mut pid = root;
    loop {
        match read_node(pager, pid)? {
            Node::Leaf(entries) => {
                return Ok(entries
                    .into_iter()
                    .find(|e| e.key == *key)
                    .map(|e| e.val));
            }
            Node::Inner { keys, children } => {
                pid = children[child_index(&keys, key, false)];
            }
        }
    }
}

/// Первая запись >= bound (inclusive=true) либо > bound (inclusive=false);
/// bound=None — минимум дерева.
pub fn btree_seek_asc(
    pager: &Pager,
    root: PageId,
    bound: Option<&EntryKey>,
    inclusive: bool,
) -> Result<Option<(EntryKey, Vec<u8>)>> {
    if root == NO_PAGE {
        return Ok(None);
    }
    seek_asc_rec(pager, root, bound, inclusive)
}

fn seek_asc_rec(
    pager: &Pager,
    pid: PageId,
    bound: Option<&EntryKey>,
    inclusive: bool,
) -> Result<Option<(EntryKey, Vec<u8>)>> {
    match read_node(pager, pid)? {
        Node::Leaf(entries) => {
            let idx = match bound {
                None => 0,
                Some(k) => entries
                    .iter()
                    .take_while(|e| {
                        if inclusive {
                            e.key < *k
                        } else {
                            e.key <= *k
                        }
                    })
                    .count(),
            };
            Ok(entries.into_iter().nth(idx).map(|e| (e.key, e.val)))
        }
        Node::Inner { keys, children } => {
            let start = match bound {
                None => 0,
                Some(k) => child_index(&keys, k, false),
            };
            for idx in start..children.len() {
                if let Some(hit) = seek_asc_rec(pager, children[idx], bound, inclusive)? {
                    return Ok(Some(hit));
                }
            }
            Ok(None)
        }
    }
}

/// Последняя запись <= bound (inclusive=true) либо < bound; bound=None — максимум.
pub fn btree_seek_desc(
    pager: &Pager,
    root: PageId,
    bound: Option<&EntryKey>,
    inclusive: bool,
) -> Result<Option<(EntryKey, Vec<u8>)>> {
    if root == NO_PAGE {
        return Ok(None);
    }
    seek_desc_rec(pager, root, bound, inclusive)
}

fn seek_desc_rec(
    pager: &Pager,
    pid: PageId,
    bound: Option<&EntryKey>,
    inclusive: bool,
) -> Result<Option<(EntryKey, Vec<u8>)>> {
    match read_node(pager, pid)? {
        Node::Leaf(entries) => {
            let hit = entries
                .into_iter()
                .rev()
                .find(|e| match bound {
                    None => true,
                    Some(k) => {
                        if inclusive {
                            e.key <= *k
                        } else {
                            e.key < *k
                        }
                    }
                });
            Ok(hit.map(|e| (e.key, e.val)))
        }
        Node::Inner { keys, children } => {
            let start = match bound {
                None => children.len() - 1,
                Some(k) => child_index(&keys, k, false),
            };
            for idx in (0..=start).rev() {
                if let Some(hit) = seek_desc_rec(pager, children[idx], bound, inclusive)? {
                    return Ok(Some(hit));
                }
            }
            Ok(None)
        }
    }
}
