pub mod permits;
pub mod random;
