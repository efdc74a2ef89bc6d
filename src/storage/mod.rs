//! Storage layer - device I/O, pages, blobs and the freelist.
//!
//! This module handles persistent storage:
//! - [`Device`] / [`DiskDevice`] / [`MemoryArena`] - byte-addressed I/O
//! - [`page`] - page descriptors and the persisted page header
//! - [`Freelist`] - reusable-area accounting
//! - [`blob`] - overflow byte areas

pub mod blob;
mod device;
mod freelist;
pub mod page;

pub use device::{Device, DiskDevice, MemoryArena};
pub use freelist::{FreeArea, Freelist};
pub use page::{AllocKind, Page, PageType, PersistedHeader};
