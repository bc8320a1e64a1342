pub mod config;
pub mod contract;
pub mod delivery;
pub mod event;
pub mod formatter;
pub mod logging;
pub mod parser;
pub mod pipeline;
pub mod shutdown;
pub mod stream;
pub mod timestamp;
