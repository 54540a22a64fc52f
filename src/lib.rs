//! # CodeQuest
//!
//! Learn an unfamiliar code repository: CodeQuest fetches it, analyzes its
//! structure, indexes its code for hybrid retrieval, and produces a guided
//! walkthrough plus question answering grounded in the indexed code.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Fetch   │──▶│ Analyze  │──▶│ Chunk+Embed  │──▶│   SQLite     │
//! │ git/local│   │ static   │   │ (LRU cache)  │   │  FTS5 + Vec  │
//! └──────────┘   └──────────┘   └──────────────┘   └──────┬───────┘
//!                      │                                  │
//!                      ▼                                  ▼
//!              ┌──────────────┐                   ┌──────────────┐
//!              │ Walkthrough  │◀── Model ────────▶│  Search/Ask  │
//!              │  synthesis   │    Selector       │   (hybrid)   │
//!              └──────────────┘                   └──────────────┘
//! ```
//!
//! The storage-free core (chunking, embedding cache, store trait, hybrid
//! scoring) lives in the `codequest-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`fetch`] | Clone or read repositories |
//! | [`analyze`] | Static analysis and learning path |
//! | [`ingest`] | Chunk, embed and store a repository |
//! | [`embedding`] | Embedding providers and retry policy |
//! | [`llm`] | Generation backends and tiered model selection |
//! | [`walkthrough`] | Walkthrough synthesis |
//! | [`quiz`] | Per-module quiz, snippets and activities |
//! | [`workflow`] | Run orchestration, idempotency and cancellation |
//! | [`search`] | Query embedding and hybrid retrieval |
//! | [`ask`] | Question answering over retrieved code |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite index store |

pub mod analyze;
pub mod app;
pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod progress;
pub mod quiz;
pub mod search;
pub mod server;
pub mod sqlite_store;
#[cfg(test)]
mod test_support;
pub mod walkthrough;
pub mod workflow;
