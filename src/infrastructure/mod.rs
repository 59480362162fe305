pub mod http_provider;
pub mod market_data;
pub mod paper_exchange;
pub mod rate_limit;
pub mod redis_store;
