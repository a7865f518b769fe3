mod builder;
pub mod pb;
mod strategy;

pub use builder::LLBBuilder;
pub use strategy::{BuildStrategy, PyboxStrategy};
