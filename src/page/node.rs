//! page/node — кодировка страниц COW B+Tree (лист и внутренняя).
//!
//! Лист (PAGE_TYPE_INDEX_LEAF), тело после общего префикса:
//!   [count u16] затем count записей:
//!     [klen u16][key bytes][oid u64][vlen u16][val bytes]
//!
//! Внутренняя (PAGE_TYPE_INDEX_INNER):
//!   [count u16]           — число детей (>= 2, кроме вырожденного корня)
//!   count * [child u64]
//!   (count-1) разделителей: [klen u16][key bytes][oid u64]
//!
//! Разделитель sep[i] — минимальный ключ поддерева child[i+1]; спуск идёт в
//! первый child[i] с key < sep[i], иначе в последний.
//!
//! Записи в листе отсортированы по (key bytes, oid). Любая аномалия
//! при декодировании — Corruption.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{ObexError, Result};
use crate::index::key::EntryKey;
use crate::types::PageId;

use super::common::{
    page_body_capacity, page_expect_type, page_init_header, PAGE_HDR_SIZE,
    PAGE_TYPE_INDEX_INNER, PAGE_TYPE_INDEX_LEAF, TRAILER_LEN,
};

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: EntryKey,
    pub val: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Vec<LeafEntry>),
    Inner {
        keys: Vec<EntryKey>,
        children: Vec<PageId>,
    },
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Размер закодированного тела (без общего префикса и трейлера).
    pub fn encoded_body_len(&self) -> usize {
        match self {
            Node::Leaf(entries) => {
                2 + entries
                    .iter()
                    .map(|e| 2 + e.key.bytes.len() + 8 + 2 + e.val.len())
                    .sum::<usize>()
            }
            Node::Inner { keys, children } => {
                2 + children.len() * 8
                    + keys.iter().map(|k| 2 + k.bytes.len() + 8).sum::<usize>()
            }
        }
    }

    /// Помещается ли узел на страницу данного размера.
    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_body_len() <= page_body_capacity(page_size)
    }

    /// Помещаются ли все длины узла в u16-поля кодировки. На больших
    /// страницах fits() по байтам этого не гарантирует.
    fn widths_fit(&self) -> bool {
        let lim = u16::MAX as usize;
        match self {
            Node::Leaf(entries) => {
                entries.len() <= lim
                    && entries
                        .iter()
                        .all(|e| e.key.bytes.len() <= lim && e.val.len() <= lim)
            }
            Node::Inner { keys, children } => {
                children.len() <= lim && keys.iter().all(|k| k.bytes.len() <= lim)
            }
        }
    }

    /// Закодировать узел в полный буфер страницы (трейлер не проставляется).
    pub fn encode(&self, page_id: PageId, page_size: usize) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(ObexError::corruption(format!(
                "btree node does not fit page {} ({} > capacity {})",
                page_id,
                self.encoded_body_len(),
                page_body_capacity(page_size)
            )));
        }
        if !self.widths_fit() {
            return Err(ObexError::corruption(format!(
                "btree node on page {} exceeds u16 length fields",
                page_id
            )));
        }
        let mut buf = vec![0u8; page_size];
        let ptype = if self.is_leaf() {
            PAGE_TYPE_INDEX_LEAF
        } else {
            PAGE_TYPE_INDEX_INNER
        };
        page_init_header(&mut buf, ptype, page_id);

        let mut off = PAGE_HDR_SIZE;
        match self {
            Node::Leaf(entries) => {
                LittleEndian::write_u16(&mut buf[off..off + 2], entries.len() as u16);
                off += 2;
                for e in entries {
                    LittleEndian::write_u16(&mut buf[off..off + 2], e.key.bytes.len() as u16);
                    off += 2;
                    buf[off..off + e.key.bytes.len()].copy_from_slice(&e.key.bytes);
                    off += e.key.bytes.len();
                    LittleEndian::write_u64(&mut buf[off..off + 8], e.key.oid);
                    off += 8;
                    LittleEndian::write_u16(&mut buf[off..off + 2], e.val.len() as u16);
                    off += 2;
                    buf[off..off + e.val.len()].copy_from_slice(&e.val);
                    off += e.val.len();
                }
            }
            Node::Inner { keys, children } => {
                LittleEndian::write_u16(&mut buf[off..off + 2], children.len() as u16);
                off += 2;
                for c in children {
                    LittleEndian::write_u64(&mut buf[off..off + 8], *c);
                    off += 8;
                }
                for k in keys {
                    LittleEndian::write_u16(&mut buf[off..off + 2], k.bytes.len() as u16);
                    off += 2;
                    buf[off..off + k.bytes.len()].copy_from_slice(&k.bytes);
                    off += k.bytes.len();
                    LittleEndian::write_u64(&mut buf[off..off + 8], k.oid);
                    off += 8;
                }
            }
        }
        Ok(buf)
    }

    /// Декодировать узел из буфера страницы.
    pub fn decode(buf: &[u8], page_id: PageId) -> Result<Node> {
        let limit = buf.len() - TRAILER_LEN;
        let corrupt =
            || ObexError::corruption(format!("truncated btree node on page {}", page_id));

        // Тип определяем по заголовку: лист или внутренняя.
        let is_leaf = match page_expect_type(buf, page_id, PAGE_TYPE_INDEX_LEAF) {
            Ok(()) => true,
            Err(_) => {
                page_expect_type(buf, page_id, PAGE_TYPE_INDEX_INNER)?;
                false
            }
        };

        let mut off = PAGE_HDR_SIZE;
        if off + 2 > limit {
            return Err(corrupt());
        }
        let count = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
        off += 2;

        if is_leaf {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                if off + 2 > limit {
                    return Err(corrupt());
                }
                let klen = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
                off += 2;
                if off + klen + 8 + 2 > limit {
                    return Err(corrupt());
                }
                let kbytes = buf[off..off + klen].to_vec();
                off += klen;
                let oid = LittleEndian::read_u64(&buf[off..off + 8]);
                off += 8;
                let vlen = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
                off += 2;
                if off + vlen > limit {
                    return Err(corrupt());
                }
                let val = buf[off..off + vlen].to_vec();
                off += vlen;
                entries.push(LeafEntry {
                    key: EntryKey::new(kbytes, oid),
                    val,
                });
            }
            Ok(Node::Leaf(entries))
        } else {
            if count < 1 {
                return Err(ObexError::corruption(format!(
                    "inner btree node on page {} has no children",
                    page_id
                )));
            }
            if off + count * 8 > limit {
                return Err(corrupt());
            }
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(LittleEndian::read_u64(&buf[off..off + 8]));
                off += 8;
            }
            let mut keys = Vec::with_capacity(count - 1);
            for _ in 0..count - 1 {
                if off + 2 > limit {
                    return Err(corrupt());
                }
                let klen = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
                off += 2;
                if off + klen + 8 > limit {
                    return Err(corrupt());
                }
                let kbytes = buf[off..off + klen].to_vec();
                off += klen;
                let oid = LittleEndian::read_u64(&buf[off..off + 8]);
                off += 8;
                keys.push(EntryKey::new(kbytes, oid));
            }
            Ok(Node::Inner { keys, children })
        }
    }
}
