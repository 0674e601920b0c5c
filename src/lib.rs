pub mod autonomy;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod resume;
pub mod tracker;
pub mod ui;
