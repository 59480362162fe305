pub mod actors;
pub mod cycle_runner;
