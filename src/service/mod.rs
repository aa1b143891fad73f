pub mod crawler;
pub mod discovery;
pub mod http;
pub mod job_manager;
pub mod maintenance;
pub mod rate_limiter;
pub mod robots;
pub mod sitemap;
pub mod worker_pool;
