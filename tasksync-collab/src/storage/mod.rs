//! Persistent storage for server-hosted tables.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  committed rows  ┌──────────────┐
//! │ MemoryTable │ ───────────────► │ RowStore     │
//! │ (in-memory) │                  │ (RocksDB)    │
//! └──────┬──────┘                  └──────┬───────┘
//!        │                                │
//!        │ on startup                     │ column families
//!        ▼                                ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ MemoryTable │     │ CF "rows"    : row JSON + seq    │
//! │ (restored)  │     │ CF "metadata": per-table info    │
//! └─────────────┘     └──────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{RowStore, StoreConfig, StoreError, StoredRow, TableMetadata};
