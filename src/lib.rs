pub mod alarm;
pub mod analysis;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod geo;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod services;
pub mod sink;
pub mod source;
pub mod storage;
