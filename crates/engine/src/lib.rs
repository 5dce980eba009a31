pub mod recovery;
pub mod retry;
pub mod throttle;
