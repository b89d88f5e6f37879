pub mod config;
pub mod event;
pub mod identity;
pub mod scope;
pub mod session;

pub use config::{GateConfig, VerifierConfig, VerifyMode};
pub use event::{extract_inbound, parse_command, InboundEvent, UserCommand};
pub use identity::{split_display_name, ResolvedIdentity, VerifiedIdentity};
pub use scope::{derive_scope, ScopeBlock, SCOPE_BLOCK_VERSION};
pub use session::{parse_session_key, SessionRef};
