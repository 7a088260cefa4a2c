//! # Corpus Assistant
//!
//! The core of a local-first desktop assistant that answers questions about
//! a local document archive by combining a keyword/notes index with
//! retrieval-augmented generation from a locally hosted model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Orchestrator │──▶│  Retriever  │──▶│            │
//! │  (intents)   │   ├─────────────┤   │   SQLite   │
//! │              │──▶│ RAG (dense) │──▶│   Store    │
//! └──────┬───────┘   └─────────────┘   └────────────┘
//!        │
//!        ▼
//! ┌──────────────┐   ┌─────────────┐
//! │   Budgeter   │──▶│  Generator  │  (llama.cpp, streaming)
//! └──────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! assistant init                       # create the index schema
//! assistant search "pagos FEAGA" --ext pdf
//! assistant ask "¿Qué plazo tiene el anticipo FEADER?"
//! assistant chat                       # interactive session
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON settings file |
//! | [`models`] | Core data types and path normalization |
//! | [`store`] | Index reads, Q&A log, admin writes |
//! | [`text`] | Diacritic folding and tokenization |
//! | [`lexicon`] | Synonyms, plural variants, extension tables |
//! | [`retriever`] | Lexical ranked search |
//! | [`embedding`] | Encoders and embedding signatures |
//! | [`rag`] | Dense fragment retrieval |
//! | [`budget`] | Token-budgeted prompt assembly |
//! | [`generator`] | Generator trait, chat formats, overflow recovery |
//! | [`orchestrator`] | Conversation turns |
//! | [`events`] | Event bus and cancellation |
//! | [`eval`] | Retrieval evaluation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod budget;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod events;
pub mod generator;
pub mod lexicon;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod rag;
pub mod retriever;
pub mod store;
pub mod text;
