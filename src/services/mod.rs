pub mod dispatcher;
pub mod encoder;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod rate_limit;
pub mod recorder;
pub mod retry;
pub mod stop;
pub mod text;
pub mod vision;
