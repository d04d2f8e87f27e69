#![allow(non_snake_case)]

// Базовые модули
pub mod config;
pub mod errors;
pub mod lock;
pub mod meta;
pub mod metrics;
pub mod types;

// Страничный слой
pub mod free;   // src/free/mod.rs
pub mod page;   // src/page/{mod,common,checksum,node,data,root}.rs
pub mod pager;  // src/pager/{mod,core,io,alloc,publish}.rs

// Индексы (COW B+Tree)
pub mod index;  // src/index/{mod,key,cow,btree,cursor}.rs

// Объектный слой
pub mod codec;
pub mod schema;

pub mod extent;
pub mod query;
pub mod session; // src/session/{mod,cache,commit}.rs
pub mod store;   // src/store/mod.rs

// Удобные реэкспорты
pub use codec::Value;
pub use config::{IterPolicy, ObexConfig};
pub use errors::{ObexError, Result};
pub use extent::ExtentIterator;
pub use query::{CmpOp, OrderBy, Predicate, Query, RangeHint};
pub use schema::{FieldDef, FieldKind};
pub use session::{ActivationMode, LifecycleState, ObjectHandle, Session};
pub use store::{Store, StoreStatus};
pub use types::{Oid, PageId, VersionId, NO_PAGE};
