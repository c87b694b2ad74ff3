pub mod application;
pub mod batch;
pub mod job;
pub mod ranking;
