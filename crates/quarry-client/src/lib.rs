pub mod fetcher;

pub use fetcher::{GraphQlFetcher, GraphQlFetcherConfig};
