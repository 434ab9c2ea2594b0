mod automation;
mod chat;
mod provider;
mod record;
mod schema;
mod tool;

pub use automation::*;
pub use chat::*;
pub use provider::*;
pub use record::*;
pub use schema::*;
pub use tool::*;
