pub mod attempt;
pub mod batch;
pub mod image;
