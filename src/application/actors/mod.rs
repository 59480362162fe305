pub mod reconciliation_actor;

pub use reconciliation_actor::*;
