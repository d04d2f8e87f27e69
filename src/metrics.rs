//! Lightweight global metrics for ObexDB.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Pager (аллокации/reuse/free)
//! - COW B+Tree (копии страниц при path copying)
//! - Commit (успехи/конфликты)
//! - ObjectCache (активации/эвикции)
//! - Query (сканы без индекса — для интроспекции)
//! - Iterators (инвалидации коммитом)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Pager -----
static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PAGES_REUSED: AtomicU64 = AtomicU64::new(0);
static PAGES_FREED: AtomicU64 = AtomicU64::new(0);

// ----- COW B+Tree -----
static COW_PAGE_COPIES: AtomicU64 = AtomicU64::new(0);
static BTREE_SPLITS: AtomicU64 = AtomicU64::new(0);

// ----- Commit -----
static COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static COMMIT_CONFLICTS: AtomicU64 = AtomicU64::new(0);

// ----- ObjectCache -----
static CACHE_ACTIVATIONS: AtomicU64 = AtomicU64::new(0);
static CACHE_EVICTIONS: AtomicU64 = AtomicU64::new(0);

// ----- Query / iterators -----
static SCANS_WITHOUT_INDEX: AtomicU64 = AtomicU64::new(0);
static ITERATORS_INVALIDATED: AtomicU64 = AtomicU64::new(0);

pub fn record_page_allocated() {
    PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_page_reused() {
    PAGES_REUSED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_pages_freed(n: u64) {
    PAGES_FREED.fetch_add(n, Ordering::Relaxed);
}
pub fn record_cow_copy() {
    COW_PAGE_COPIES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_btree_split() {
    BTREE_SPLITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_commit() {
    COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}
pub fn record_commit_conflict() {
    COMMIT_CONFLICTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_activation() {
    CACHE_ACTIVATIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_eviction() {
    CACHE_EVICTIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_scan_without_index() {
    SCANS_WITHOUT_INDEX.fetch_add(1, Ordering::Relaxed);
}
pub fn record_iterator_invalidated() {
    ITERATORS_INVALIDATED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub pages_allocated: u64,
    pub pages_reused: u64,
    pub pages_freed: u64,

    pub cow_page_copies: u64,
    pub btree_splits: u64,

    pub commits_total: u64,
    pub commit_conflicts: u64,

    pub cache_activations: u64,
    pub cache_evictions: u64,

    pub scans_without_index: u64,
    pub iterators_invalidated: u64,
}

/// Снять атомарный снимок всех счётчиков.
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        pages_allocated: PAGES_ALLOCATED.load(Ordering::Relaxed),
        pages_reused: PAGES_REUSED.load(Ordering::Relaxed),
        pages_freed: PAGES_FREED.load(Ordering::Relaxed),
        cow_page_copies: COW_PAGE_COPIES.load(Ordering::Relaxed),
        btree_splits: BTREE_SPLITS.load(Ordering::Relaxed),
        commits_total: COMMITS_TOTAL.load(Ordering::Relaxed),
        commit_conflicts: COMMIT_CONFLICTS.load(Ordering::Relaxed),
        cache_activations: CACHE_ACTIVATIONS.load(Ordering::Relaxed),
        cache_evictions: CACHE_EVICTIONS.load(Ordering::Relaxed),
        scans_without_index: SCANS_WITHOUT_INDEX.load(Ordering::Relaxed),
        iterators_invalidated: ITERATORS_INVALIDATED.load(Ordering::Relaxed),
    }
}
