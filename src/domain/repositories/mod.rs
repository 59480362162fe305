pub mod ai_provider;
pub mod alert_dispatcher;
pub mod audit_sink;
pub mod exchange_client;
pub mod kv_store;
pub mod market_data;
pub mod trade_store;
