//! query — исполнитель скомпилированных запросов.
//!
//! Парсер языка запросов живёт снаружи; сюда приходит уже скомпилированный
//! предикат, опциональная индексная подсказка (поле + оператор) и порядок.
//! Исполнитель выбирает между диапазонным проходом индекса и полным сканом
//! экстента с фильтрацией; скан без индекса фиксируется в метриках.

use std::cmp::Ordering;

use crate::codec::Value;
use crate::errors::{ObexError, Result};
use crate::index::{index_name, EntryKey, IndexKey, RangeCursor};
use crate::metrics::record_scan_without_index;
use crate::session::{ObjectHandle, Session, Slot};
use crate::types::Oid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Подсказка от компилятора запроса: "по этому полю есть пригодный индекс".
#[derive(Debug, Clone)]
pub struct RangeHint {
    pub field: String,
    pub op: CmpOp,
    pub key: Value,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    True,
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub class: String,
    pub include_subclasses: bool,
    pub predicate: Predicate,
    pub hint: Option<RangeHint>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn all(class: &str) -> Self {
        Query {
            class: class.to_string(),
            include_subclasses: false,
            predicate: Predicate::True,
            hint: None,
            order_by: None,
        }
    }

    /// `field >= key` с индексной подсказкой по тому же полю.
    pub fn range(class: &str, field: &str, key: Value) -> Self {
        Query {
            class: class.to_string(),
            include_subclasses: false,
            predicate: Predicate::Cmp {
                field: field.to_string(),
                op: CmpOp::Ge,
                value: key.clone(),
            },
            hint: Some(RangeHint {
                field: field.to_string(),
                op: CmpOp::Ge,
                key,
            }),
            order_by: None,
        }
    }
}

/// Сравнение значений одного типа; разнотипные пары несравнимы.
pub fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::I64(x), Value::I64(y)) => Some(x.cmp(y)),
        (Value::F64(x), Value::F64(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Ref(x), Value::Ref(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn op_holds(ord: Ordering, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    }
}

fn eval(sess: &mut Session, h: ObjectHandle, p: &Predicate) -> Result<bool> {
    Ok(match p {
        Predicate::True => true,
        Predicate::Cmp { field, op, value } => {
            let v = sess.get_field(h, field)?;
            match cmp_values(&v, value) {
                Some(ord) => op_holds(ord, *op),
                None => false,
            }
        }
        Predicate::And(ps) => {
            for sub in ps {
                if !eval(sess, h, sub)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or(ps) => {
            for sub in ps {
                if eval(sess, h, sub)? {
                    return Ok(true);
                }
            }
            false
        }
        Predicate::Not(sub) => !eval(sess, h, sub)?,
    })
}

/// Границы диапазона по ключу индекса. OID-сентинели не пересекаются с
/// настоящими записями: OID 0 не выдаётся никогда.
fn hint_bounds(hint: &RangeHint) -> Result<(Option<EntryKey>, Option<EntryKey>)> {
    let bytes = IndexKey::from_value(&hint.key)?.encode();
    Ok(match hint.op {
        CmpOp::Eq => (
            Some(EntryKey::lower_bound(bytes.clone())),
            Some(EntryKey::upper_bound(bytes)),
        ),
        CmpOp::Ge => (Some(EntryKey::lower_bound(bytes)), None),
        CmpOp::Gt => (Some(EntryKey::upper_bound(bytes)), None),
        CmpOp::Le => (None, Some(EntryKey::upper_bound(bytes))),
        CmpOp::Lt => (None, Some(EntryKey::lower_bound(bytes))),
    })
}

pub fn execute(sess: &mut Session, q: &Query) -> Result<Vec<ObjectHandle>> {
    sess.require_txn()?;

    // Индексы точные по классу: запрос с подклассами обязан идти через
    // экстент, иначе экземпляры потомков потеряются.
    let subclass_fanout = q.include_subclasses && {
        let schemas = sess.lock_schemas()?;
        schemas.class_ids_with_subclasses(&q.class)?.len() > 1
    };

    // Кандидаты: индексный диапазон либо полный скан экстента.
    let index_used = !subclass_fanout
        && q.hint.is_some()
        && sess
            .txn
            .as_ref()
            .map(|t| {
                q.hint
                    .as_ref()
                    .map(|h| t.catalog.index(&index_name(&q.class, &h.field)).is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false);

    let mut handles: Vec<ObjectHandle> = Vec::new();
    if index_used {
        let hint = q.hint.as_ref().ok_or_else(|| ObexError::usage("missing hint"))?;
        let (root, desc) = {
            let txn = sess
                .txn
                .as_ref()
                .ok_or_else(|| ObexError::usage("no active transaction"))?;
            let def = txn
                .catalog
                .index(&index_name(&q.class, &hint.field))
                .ok_or_else(|| ObexError::usage("index disappeared"))?;
            let descending = q.order_by.as_ref().map(|o| o.descending).unwrap_or(false);
            (def.root, descending)
        };
        let (lo, hi) = hint_bounds(hint)?;
        let oids: Vec<Oid> = {
            let pager = sess.lock_pager()?;
            let mut cur = RangeCursor::new(root, lo, hi, desc);
            let mut out = Vec::new();
            while let Some((k, _)) = cur.next(&pager)? {
                out.push(k.oid);
            }
            out
        };
        for oid in oids {
            // Скрываем несохранённые удаления этой сессии.
            if sess.cache.get(Slot::Oid(oid)).map(|o| o.state.is_deleted()) == Some(true) {
                continue;
            }
            let h = sess.open(oid)?;
            if eval(sess, h, &q.predicate)? {
                handles.push(h);
            }
        }
    } else {
        record_scan_without_index();
        log::debug!(
            "query over {} executed without index (full extent scan)",
            q.class
        );
        let mut it = sess.extent(&q.class, q.include_subclasses)?;
        while let Some(h) = it.next(sess)? {
            if eval(sess, h, &q.predicate)? {
                handles.push(h);
            }
        }
    }

    // Страховочный фильтр индексного пути по точному классу.
    if index_used {
        let class_id = {
            let schemas = sess.lock_schemas()?;
            schemas.class(&q.class)?.class_id
        };
        let mut kept = Vec::with_capacity(handles.len());
        for h in handles {
            let slot = sess.cache.canonical(h.slot);
            let cid = sess.cache.get(slot).map(|o| o.class_id).unwrap_or(0);
            if cid == class_id {
                kept.push(h);
            }
        }
        handles = kept;
    }

    // Материализация-сортировка для order by; индексный проход по тому же
    // полю уже даёт нужный порядок.
    if let Some(order) = &q.order_by {
        let satisfied = index_used
            && q.hint
                .as_ref()
                .map(|h| h.field == order.field)
                .unwrap_or(false);
        if !satisfied {
            let mut keyed: Vec<(Value, ObjectHandle)> = Vec::with_capacity(handles.len());
            for h in handles {
                keyed.push((sess.get_field(h, &order.field)?, h));
            }
            keyed.sort_by(|(a, _), (b, _)| cmp_values(a, b).unwrap_or(Ordering::Equal));
            if order.descending {
                keyed.reverse();
            }
            handles = keyed.into_iter().map(|(_, h)| h).collect();
        }
    }
    Ok(handles)
}
