pub mod automation;
pub mod config;
pub mod event_bus;
pub mod orchestrator;
pub mod sandbox;
pub mod schema_prompt;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39741;

pub use automation::*;
pub use config::*;
pub use event_bus::*;
pub use orchestrator::*;
pub use sandbox::*;
pub use schema_prompt::*;
