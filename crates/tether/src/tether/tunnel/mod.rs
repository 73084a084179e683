//! Reverse tunnel (rendezvous) fabric, frp style.
//!
//! A client keeps one control connection to the server, asks it to open a
//! public port, and dials back a data connection for every user that
//! connects to that port. Wire format: `frame` and `message` for the control
//! channel, `handshake` for the data-connection prefix.

pub mod client;
pub mod crypto;
pub mod dispatch;
pub mod frame;
pub mod handshake;
pub mod ids;
pub mod message;
pub mod proxy;
pub mod server;
