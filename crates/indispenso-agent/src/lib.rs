//! `indispenso-agent`: the node side of Indispenso.
//!
//! A node registers with the server, keeps its per-client token fresh and
//! long-polls for work. Every delivered command runs on its own task:
//!
//! ```text
//! Node::run
//!     │  ping / auth / poll  (Transport, signed X-Auth requests)
//!     ▼
//! Executor                 ← verifies the HMAC, reports each state change
//!     │
//!     ▼
//! ScriptProcess            ← `bash <tmp>/indispenso_<id>`, own process group
//!     │                       killed as a group on timeout
//!     ▼
//! LogBuffer                ← flushes stdout/stderr in batches
//! ```

pub mod error;
pub mod executor;
pub mod logs;
pub mod node;
pub mod process;
pub mod transport;

pub use error::AgentError;
pub use executor::Executor;
pub use node::Node;
pub use transport::{ServerLink, Transport};

pub type Result<T> = std::result::Result<T, AgentError>;
