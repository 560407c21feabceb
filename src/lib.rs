pub mod api;
pub mod concurrent_fetcher;
pub mod data_collector;
pub mod errors;
pub mod logging;
pub mod models;
pub mod normalizer;
pub mod utils;
