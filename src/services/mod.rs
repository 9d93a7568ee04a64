pub mod engine;
pub mod neighbors;
pub mod projection;
pub mod sweeper;
