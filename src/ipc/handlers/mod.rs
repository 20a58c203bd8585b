pub mod assignments;
pub mod core;
pub mod promotion;
pub mod rollover;
pub mod setup;
pub mod signatures;
