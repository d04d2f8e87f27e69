//! Базовые идентификаторы стора.

/// Идентификатор объекта: уникальный в пределах стора, никогда не переиспользуется.
pub type Oid = u64;

/// Номер страницы в файле данных.
pub type PageId = u64;

/// Монотонный номер опубликованной версии (commit sequence number).
pub type VersionId = u64;

/// «Нет страницы» (хвост цепочки, пустой корень).
pub const NO_PAGE: PageId = u64::MAX;
