pub mod address;
pub mod content;
pub mod media;
pub mod protocol;
pub mod state;
pub mod verification;

pub use address::Address;
pub use content::{ContentMap, ContentMapError};
pub use media::{MediaKind, MediaSet};
pub use protocol::SessionId;
pub use state::{InvalidTransition, Reason, SessionState};
