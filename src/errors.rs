//! Таксономия ошибок ObexDB.
//!
//! Пять категорий (+ I/O):
//! - Usage       — ошибка программиста (закрытая сессия, чужой handle, повторное удаление);
//!                 не ретраится.
//! - Conflict    — оптимистическая верификация на commit не прошла; несёт ПОЛНЫЙ список
//!                 конфликтующих OID; вызывающий код может повторить транзакцию.
//! - NotFound    — активация/чтение по OID, который удалён или не существует.
//! - Corruption  — неожиданная структура страницы / битый заголовок файла; стор
//!                 считается непригодным до ремонта.
//! - Constraint  — нарушение уникального индекса (insert или create_index по
//!                 существующим данным).
//!
//! Политика: ничего не глотаем; где известны OID/поле — они попадают в сообщение.

use crate::types::Oid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObexError {
    /// Programmer error: invalid handle/session state. Never retried.
    #[error("usage error: {0}")]
    Usage(String),

    /// Optimistic verification failed; carries every conflicting OID.
    #[error("optimistic conflict on {} object(s): {oids:?}", oids.len())]
    Conflict { oids: Vec<Oid> },

    /// Lookup/activation against a deleted or never-existing OID.
    #[error("object {0} not found")]
    NotFound(Oid),

    /// Fatal: unexpected page structure or illegal file header.
    #[error("data store corruption: {0}")]
    Corruption(String),

    /// Unique-index violation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObexError {
    pub fn usage(msg: impl Into<String>) -> Self {
        ObexError::Usage(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        ObexError::Corruption(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        ObexError::Constraint(msg.into())
    }

    /// Conflict с отсортированным списком OID (детерминированный порядок для тестов/логов).
    pub fn conflict(mut oids: Vec<Oid>) -> Self {
        oids.sort_unstable();
        oids.dedup();
        ObexError::Conflict { oids }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ObexError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, ObexError>;
