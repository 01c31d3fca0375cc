//! Fake POP3 origin server for integration testing
//!
//! An in-process origin that speaks enough POP3 to exercise the proxy
//! end-to-end:
//!
//! greeting -> CAPA -> USER/PASS -> STAT/LIST/RETR/... -> QUIT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener and per-connection command loop
//! - `mailbox` -- test data model (greeting, capabilities, mails)

pub mod mailbox;
mod server;

pub use mailbox::OriginBuilder;
pub use server::FakeOriginServer;
