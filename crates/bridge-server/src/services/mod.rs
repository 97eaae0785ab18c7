pub mod block_guard;
pub mod device_flow;
pub mod patrol_score;
pub mod rate_limiter;
pub mod score_update;
pub mod token_refresh;
pub mod upstream_client;
pub mod user_code;
pub mod web_flow;
