pub mod keyed;
pub mod pipeline;
