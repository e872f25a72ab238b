//! Purpose: Columnar page storage library behind the `colpage` CLI and tests.
//! Exports: `api` (columns, sinks, sources, stores, validation, errors).
//! Role: Library crate; `api` is the supported surface, `core` holds the storage internals.
//! Invariants: One writer per dataset; any number of readers per attached source.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;
