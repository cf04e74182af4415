//! Call signaling engine for XMPP clients.
//!
//! The protocol model (addresses, content maps, the session state machine)
//! lives in the [`jinglecore`] crate; this crate adds the asynchronous call
//! engine in [`calls`].

pub use jinglecore;

pub mod calls;
pub mod crypto;
pub mod loopback;
