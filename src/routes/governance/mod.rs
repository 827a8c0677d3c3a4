mod handler;

pub use handler::{health, stats};
