pub mod audit;
pub mod commission;
