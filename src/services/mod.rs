pub mod arxiv;
pub mod enrichment;
pub mod format;
pub mod llm_provider;
pub mod matrix;
pub mod telegram;
pub mod transport;
