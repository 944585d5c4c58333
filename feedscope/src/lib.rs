// Library interface for feedscope modules
// This allows tests and the binary to import modules

pub mod cache;
pub mod error;
pub mod feed_store;
pub mod ingestion;
pub mod llm;
pub mod model;
pub mod parser;
pub mod storage;
pub mod worker;
