//! Search provider access for Leadscope.
//!
//! - [`SearchProvider`]: the trait the fetcher depends on
//! - [`TavilyClient`]: Tavily-compatible HTTP implementation
//! - [`query`]: phrase query and domain-guess construction
//! - [`format`]: markdown evidence formatting and size-bounded truncation

pub mod format;
pub mod provider;
pub mod query;
pub mod tavily;

pub use format::{RESULTS_HEADER, format_results, truncate_structured};
pub use provider::{SearchDepth, SearchError, SearchHit, SearchProvider, SearchRequest, SearchResponse};
pub use query::{build_query, core_name, domain_guesses};
pub use tavily::TavilyClient;
