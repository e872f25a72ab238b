//! Purpose: Shared cache of populated read pages keyed by column and index range.
//! Exports: `PagePool`, `PageDeleter`.
//! Role: Deduplicates page-record fetches across columns and readers; owns release timing.
//! Invariants: A page is evicted only when no reader holds it (pool handle is the last `Arc`).
//! Invariants: Every registered deleter runs exactly once, on eviction or pool drop.
//! Invariants: At most one entry and one in-flight population exist per (column, range_first).
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::core::descriptor::ColumnId;
use crate::core::error::Result;
use crate::core::page::Page;

/// Release callback run when a pooled page is evicted.
pub struct PageDeleter(Box<dyn FnOnce(&Page) + Send>);

impl PageDeleter {
    pub fn new(release: impl FnOnce(&Page) + Send + 'static) -> Self {
        Self(Box::new(release))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    fn run(self, page: &Page) {
        (self.0)(page)
    }
}

impl fmt::Debug for PageDeleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageDeleter")
    }
}

#[derive(Debug)]
struct PoolEntry {
    page: Arc<Page>,
    deleter: Option<PageDeleter>,
    last_used: u64,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.page) == 1
    }

    fn release(mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter.run(&self.page);
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    in_flight: HashSet<(ColumnId, u64)>,
    clock: u64,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn hit(&mut self, column_id: ColumnId, index: u64) -> Option<Arc<Page>> {
        let now = self.tick();
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.page.column_id() == column_id && entry.page.contains(index))?;
        entry.last_used = now;
        Some(Arc::clone(&entry.page))
    }
}

/// Clears an in-flight marker and wakes waiters, also when population fails or panics.
struct InFlight<'a> {
    pool: &'a PagePool,
    key: (ColumnId, u64),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pool.lock().in_flight.remove(&self.key);
        self.pool.populated.notify_all();
    }
}

#[derive(Debug)]
pub struct PagePool {
    state: Mutex<PoolState>,
    populated: Condvar,
    idle_budget: usize,
}

impl PagePool {
    /// `idle_budget` unreferenced pages stay cached; 0 evicts as soon as a page is returned.
    pub fn new(idle_budget: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            populated: Condvar::new(),
            idle_budget,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached page of `column_id` containing `index`.
    pub fn get_page(&self, column_id: ColumnId, index: u64) -> Option<Arc<Page>> {
        let page = self.lock().hit(column_id, index)?;
        tracing::trace!(column = column_id, index, "page pool hit");
        Some(page)
    }

    /// Cached page of `column_id` containing `index`, or the page built by `populate`.
    ///
    /// `range_first` names the page that will cover `index`. Concurrent callers for the
    /// same page wait for the first one instead of running `populate` again.
    pub fn get_or_populate(
        &self,
        column_id: ColumnId,
        index: u64,
        range_first: u64,
        populate: impl FnOnce() -> Result<(Page, PageDeleter)>,
    ) -> Result<Arc<Page>> {
        let key = (column_id, range_first);
        {
            let mut state = self.lock();
            loop {
                if let Some(page) = state.hit(column_id, index) {
                    tracing::trace!(column = column_id, index, "page pool hit");
                    return Ok(page);
                }
                if state.in_flight.insert(key) {
                    break;
                }
                state = self
                    .populated
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        let _in_flight = InFlight { pool: self, key };
        let (page, deleter) = populate()?;
        Ok(self.register_page(page, deleter))
    }

    /// Adds a populated page and returns the handle the caller should hold.
    ///
    /// When a page with the same column and range start is already cached, the cached
    /// handle is returned and `deleter` runs on the new page immediately.
    pub fn register_page(&self, page: Page, deleter: PageDeleter) -> Arc<Page> {
        let (page, evicted) = {
            let mut state = self.lock();
            let now = state.tick();
            let existing = state.entries.iter_mut().find(|entry| {
                entry.page.column_id() == page.column_id()
                    && entry.page.range_first() == page.range_first()
            });
            if let Some(entry) = existing {
                entry.last_used = now;
                let cached = Arc::clone(&entry.page);
                drop(state);
                tracing::trace!(
                    column = page.column_id(),
                    range_first = page.range_first(),
                    "page pool duplicate dropped"
                );
                deleter.run(&page);
                return cached;
            }
            let page = Arc::new(page);
            state.entries.push(PoolEntry {
                page: Arc::clone(&page),
                deleter: Some(deleter),
                last_used: now,
            });
            (page, self.take_evictions(&mut state))
        };
        release_all(evicted);
        page
    }

    /// Gives back a handle obtained from `get_page` or `register_page`.
    pub fn return_page(&self, page: Arc<Page>) {
        drop(page);
        let evicted = {
            let mut state = self.lock();
            self.take_evictions(&mut state)
        };
        release_all(evicted);
    }

    /// Evicts every unreferenced page regardless of the idle budget.
    pub fn evict_idle(&self) -> usize {
        let evicted = {
            let mut state = self.lock();
            let (idle, busy): (Vec<_>, Vec<_>) =
                state.entries.drain(..).partition(PoolEntry::is_idle);
            state.entries = busy;
            idle
        };
        let count = evicted.len();
        release_all(evicted);
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_budget(&self) -> usize {
        self.idle_budget
    }

    fn take_evictions(&self, state: &mut PoolState) -> Vec<PoolEntry> {
        let mut idle: Vec<(u64, usize)> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_idle())
            .map(|(pos, entry)| (entry.last_used, pos))
            .collect();
        if idle.len() <= self.idle_budget {
            return Vec::new();
        }
        idle.sort_unstable();
        let excess = idle.len() - self.idle_budget;
        let mut doomed: Vec<usize> = idle[..excess].iter().map(|(_, pos)| *pos).collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        doomed
            .into_iter()
            .map(|pos| state.entries.swap_remove(pos))
            .collect()
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        release_all(state.entries.drain(..).collect());
    }
}

fn release_all(entries: Vec<PoolEntry>) {
    for entry in entries {
        tracing::trace!(
            column = entry.page.column_id(),
            range_first = entry.page.range_first(),
            "page pool eviction"
        );
        entry.release();
    }
}
