pub mod alerts;
pub mod config;
pub mod controller;
pub mod dashboard;
pub mod environment;
pub mod error;
pub mod job;
pub mod medium;
pub mod shutdown;
pub mod slots;
pub mod volume;
