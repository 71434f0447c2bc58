pub mod cancel;
pub mod error;
pub mod group;
pub mod sleep;
mod timer;
