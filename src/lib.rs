//! termrelay - interactive shell sessions over WebSocket.
//!
//! Each WebSocket connection may start one session. The server spawns a shell
//! for it, screens every command through a denylist, relays stdout and stderr
//! back as JSON events, and tears the shell down on kill, disconnect, idle
//! timeout or server shutdown.
//!
//! The denylist is a best-effort guard, not a sandbox: commands it does not
//! recognize run with the full privileges of the server process.

pub mod api;
pub mod config;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod validator;
