pub mod circuit_breaker;
pub mod consensus;
pub mod correlation;
pub mod funding_guard;
pub mod gap_detector;
pub mod lease_lock;
pub mod order_policy;
pub mod position_sizer;
pub mod reconciliation;
pub mod risk_gate;
pub mod stop_calculator;
pub mod trade_effects;
pub mod veto_limiter;
