//! Multi-room chat relay over plain TCP.
//!
//! Clients register with two lines (username, then room), after which every
//! line they send is relayed to all members of that room, themselves
//! included. Newcomers are first sent the room's history. Files travel inline
//! on the same connection as a `FILE:<name>` line, a byte-count line and the
//! raw payload.
//!
//! - [`codec`] reads and writes line frames.
//! - [`history`] keeps each room's log for replay.
//! - [`registry`] maps rooms to members and fans out broadcasts.
//! - [`session`] runs the per-connection state machine on the server.
//! - [`server`] accepts connections and spawns sessions.
//! - [`transfer`] implements both halves of the file-transfer frames.
//! - [`client`] owns a client's connection, re-registration and sends.
//! - [`terminal`] is a stdin/stdout front end over [`client`].
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod codec;
pub mod history;
pub mod registry;
pub mod server;
pub mod session;
pub mod terminal;
pub mod transfer;
