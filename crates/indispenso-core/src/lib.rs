pub mod cmd;
pub mod config;
pub mod error;
pub mod io;
pub mod signing;
pub mod strategy;
pub mod template;
pub mod types;
pub mod validation;

pub use cmd::{Cmd, CmdPayload, LogBatch};
pub use error::{IndispensoError, Result};
pub use strategy::ExecutionStrategy;
pub use template::{JsonTemplateStore, Template, TemplateStore, ValidationRule};
pub use types::{CmdState, OutputStream};
