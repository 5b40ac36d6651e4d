//! MyAnimeList API v2.

mod adapter;
mod types;

pub use adapter::MalAdapter;
