pub mod audit;
pub mod deletion;
