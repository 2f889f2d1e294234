// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`LocalBackend`]: in-process maps, no history
//! - [`PooledSqlBackend`]: shared MySQL/SQLite through a bounded pool
//! - [`FallbackBackend`]: primary with a one-way switch to a secondary

pub mod fallback;
pub mod memory;
pub mod sql;
pub mod traits;

pub use fallback::{FallbackBackend, Tier};
pub use memory::LocalBackend;
pub use sql::PooledSqlBackend;
pub use traits::{ImportOutcome, StorageBackend, StorageError};
