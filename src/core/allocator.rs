//! Purpose: Create and destroy page buffers for columns and the page pool.
//! Exports: `PageAllocator`.
//! Role: Single place where page memory is obtained; columns and the pool never free buffers.
//! Invariants: Heap pages start empty and zeroed; record pages are full and immutable.
//! Invariants: A record page keeps its record alive until the page is deleted.
use bytes::Bytes;

use crate::core::descriptor::ColumnId;
use crate::core::page::{Page, PageMemory};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageAllocator {
    Heap,
    Record,
}

impl PageAllocator {
    /// Zeroed write page with room for `n_elements`.
    pub fn new_heap_page(column_id: ColumnId, element_size: usize, n_elements: usize) -> Page {
        let memory = PageMemory::Heap(vec![0u8; element_size * n_elements]);
        Page::new(column_id, memory, element_size, n_elements)
    }

    /// Full read page over `content`; `content.len()` must equal `element_size * n_elements`.
    pub fn new_record_page(
        column_id: ColumnId,
        content: Bytes,
        element_size: usize,
        n_elements: usize,
    ) -> Page {
        debug_assert_eq!(content.len(), element_size * n_elements);
        let mut page = Page::new(column_id, PageMemory::Record(content), element_size, n_elements);
        page.fill();
        page
    }

    pub fn strategy_of(page: &Page) -> Self {
        if page.is_record_backed() {
            PageAllocator::Record
        } else {
            PageAllocator::Heap
        }
    }

    /// Releases a page allocated by this strategy.
    pub fn delete_page(self, page: Page) {
        debug_assert_eq!(Self::strategy_of(&page), self);
        tracing::trace!(
            column = page.column_id(),
            range_first = page.range_first(),
            strategy = ?self,
            "page released"
        );
        drop(page);
    }
}

#[cfg(test)]
mod tests {
    use super::PageAllocator;
    use bytes::Bytes;

    #[test]
    fn heap_pages_start_empty() {
        let page = PageAllocator::new_heap_page(3, 8, 16);
        assert_eq!(page.capacity(), 16);
        assert!(page.is_empty());
        assert_eq!(PageAllocator::strategy_of(&page), PageAllocator::Heap);
        PageAllocator::Heap.delete_page(page);
    }

    #[test]
    fn record_pages_start_full() {
        let record = Bytes::from(vec![0u8; 64]);
        let content = record.slice(16..48);
        let page = PageAllocator::new_record_page(3, content, 4, 8);
        assert_eq!(page.n_elements(), 8);
        assert_eq!(page.bytes().len(), 32);
        assert_eq!(PageAllocator::strategy_of(&page), PageAllocator::Record);
    }
}
