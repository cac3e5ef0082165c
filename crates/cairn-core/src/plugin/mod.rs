pub mod registry;
pub mod trait_def;

pub use registry::PluginRegistry;
pub use trait_def::Plugin;
