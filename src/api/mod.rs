//! Purpose: Define the public Rust API boundary for colpage.
//! Exports: Column and storage types plus the operations needed by the CLI and tests.
//! Role: Public, additive-only surface; hides internal codec modules.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Record encoding helpers stay internal.

mod validation;

pub use crate::core::allocator::PageAllocator;
pub use crate::core::column::{CollectionInfo, Column, ConnectColumns};
pub use crate::core::descriptor::{ColumnId, ColumnModel, ColumnType, FieldDescriptor};
pub use crate::core::element::{ClusterSize, Element};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::format::{DatasetKeys, FORMAT_VERSION};
pub use crate::core::page::{ClusterInfo, Page};
pub use crate::core::page_pool::{PageDeleter, PagePool};
pub use crate::core::sink::{ColumnHandle, PageSink, SinkOptions, DEFAULT_ELEMENTS_PER_PAGE};
pub use crate::core::source::{
    ClusterRange, PageLocator, PageSource, SourceOptions, DEFAULT_POOL_IDLE_PAGES,
};
pub use crate::core::store::{DirStore, MemStore, RecordStore, StoreStats};
pub use validation::{validate_dataset, ValidationIssue, ValidationReport, ValidationStatus};
