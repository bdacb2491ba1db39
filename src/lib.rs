pub mod config;
pub mod db;
pub mod dedup;
pub mod feed;
pub mod fetcher;
pub mod filter;
pub mod model;
pub mod store;
pub mod sync;
pub mod writer;
