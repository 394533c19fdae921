pub mod finish;
pub mod math;
