pub mod config;
pub mod reindex;
pub mod serve;
pub mod status;

pub use config::handle_config_command;
pub use reindex::run_reindex;
pub use serve::run_serve;
pub use status::show_status;
