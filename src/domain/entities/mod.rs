pub mod audit;
pub mod decision;
pub mod market;
pub mod order;
pub mod trade;
