//! Context search — keyword indexes over the tools, resources and prompts
//! the fleet currently offers.

pub mod aggregator;
pub mod index;
pub mod tokenizer;

pub use aggregator::{
    ContextAggregator, ContextQuery, ContextSummary, ProviderContext, SearchResult,
    DEFAULT_SEARCH_LIMIT,
};
pub use index::KeywordIndex;
