//! index — COW B+Tree и ключевые кодировки.
//!
//! Дерево никогда не изменяет опубликованные страницы: каждое изменение
//! копирует путь от листа к корню (path copying) и возвращает id нового
//! корня. Читатели, привязанные к старому корню, не видят изменений.

pub mod btree;
pub mod cow;
pub mod cursor;
pub mod key;

pub use btree::{btree_insert, btree_lookup, btree_remove, InsertMode, MAX_ENTRY_PART_LEN};
pub use cow::CowTxn;
pub use cursor::RangeCursor;
pub use key::{EntryKey, IndexKey};

/// Имя пользовательского индекса: `<class>.<field>`.
pub fn index_name(class: &str, field: &str) -> String {
    format!("{}.{}", class, field)
}
