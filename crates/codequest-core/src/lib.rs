//! # CodeQuest Core
//!
//! Shared, runtime-agnostic logic for CodeQuest: data models, the code
//! chunker, the embedding trait with its content-addressed cache, the
//! index store abstraction with an in-memory implementation, and the
//! hybrid search algorithm.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network
//! dependencies. The `codequest` application crate supplies the SQLite
//! store, the HTTP embedding providers, and the workflow orchestrator.

pub mod chunk;
pub mod embedding;
pub mod models;
pub mod search;
pub mod store;
