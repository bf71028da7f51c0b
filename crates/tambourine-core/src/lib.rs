pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TambourineError};
pub use events::{ConfigResponse, EventRelay, RelayEvent};
pub use types::*;
