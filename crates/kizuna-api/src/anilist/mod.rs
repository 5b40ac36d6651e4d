mod adapter;
mod queries;
mod types;

pub use adapter::AniListAdapter;
