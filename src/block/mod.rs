pub mod genesis;
pub mod types;

pub use types::{merkle_root, Block};
