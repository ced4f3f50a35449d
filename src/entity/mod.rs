pub mod active_session;
pub mod user_limits;
pub mod user_usage;
