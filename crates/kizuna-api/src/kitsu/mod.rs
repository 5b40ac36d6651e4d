mod adapter;
mod types;

pub use adapter::KitsuAdapter;
