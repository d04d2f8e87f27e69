//! page — форматы страниц: общий префикс, трейлер checksum, узлы B+Tree,
//! страницы данных объектов и корневой каталог.

pub mod checksum;
pub mod common;
pub mod data;
pub mod node;
pub mod root;

pub use checksum::{page_update_checksum, page_verify_checksum};
pub use common::{
    page_body_capacity, page_check_header, page_expect_type, page_init_header, PAGE_HDR_SIZE,
    PAGE_MAGIC, PAGE_TYPE_INDEX_INNER, PAGE_TYPE_INDEX_LEAF, PAGE_TYPE_OBJECT_DATA,
    PAGE_TYPE_ROOT_CATALOG, PAGE_VERSION, TRAILER_LEN,
};
pub use data::{decode_data_page, encode_data_page, find_record, max_object_payload, DataRecord};
pub use node::{LeafEntry, Node};
pub use root::{
    chain_chunk_capacity, decode_chain_page, encode_chain_page, IndexDef, RootCatalog,
};
