#![forbid(unsafe_code)]

mod assets;
mod cache;
mod events;
mod gates;
mod jobs;
mod units;
mod verify;

pub use assets::*;
pub use cache::*;
pub use events::*;
pub use gates::*;
pub use jobs::*;
pub use units::*;
pub use verify::*;
