//! Triage Tools - retrieval back ends for the support pipeline
//!
//! - knowledge_base: solution entries ranked by lexical overlap
//! - search_api: HTTP search service client

pub mod knowledge_base;
pub mod search_api;

pub use knowledge_base::{KnowledgeBase, KnowledgeBaseError, SearchHit, Solution};
pub use search_api::{SearchClient, SearchError, SearchPassage};
