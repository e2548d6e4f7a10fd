#![forbid(unsafe_code)]

mod phase;
mod status;

pub use phase::*;
pub use status::*;

#[cfg(test)]
mod tests;
