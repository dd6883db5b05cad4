pub mod acquisition_engine;
pub mod retry_policy;
pub mod shared_session;
