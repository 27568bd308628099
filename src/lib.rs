pub mod audit;
pub mod config;
pub mod consistency;
pub mod errors;
pub mod generation;
pub mod logging;
pub mod memory;
pub mod publish;
pub mod quill_config;
pub mod stages;
pub mod ui;
pub mod work;
pub mod workflow;
