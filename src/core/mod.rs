// Core modules implementing page storage, record encoding, and error modeling.
pub mod allocator;
pub mod column;
pub mod descriptor;
pub mod element;
pub mod error;
pub mod format;
pub mod page;
pub mod page_pool;
pub mod sink;
pub mod source;
pub mod store;
