mod config_cmd;
mod package;

pub use config_cmd::{ConfigCommand, OutputFormat};
pub use package::PackageCommand;
