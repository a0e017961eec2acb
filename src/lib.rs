//! Askflow - question routing and answering core for a company knowledge assistant
//!
//! Classifies each question into technical, business, personal or mixed
//! domains, retrieves evidence with hybrid exact/BM25/dense search, turns
//! business questions into validated query plans over activity records,
//! dispatches to a tiered model, and caches answers per fingerprint.

pub mod business;
pub mod cache;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod lexicon;
pub mod memory;
pub mod prompt;
pub mod provider;
pub mod retrieval;
pub mod tier;

pub use engine::{Answer, EngineBuilder, KnowledgeEngine, Query};
pub use error::{AskflowError, DomainError, Result};
