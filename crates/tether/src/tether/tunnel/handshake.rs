//! Data-connection prefix: `DATA_CONN_FLAG (4B)` + `session_id (u32be)`.
//!
//! The dialing client sends it first on a fresh data connection; the data
//! proxy echoes the same eight bytes back once the session is paired.

use bytes::Buf;

pub const DATA_CONN_FLAG: [u8; 4] = [0x7f, b'T', b'D', b'C'];
pub const HANDSHAKE_LEN: usize = 8;

pub fn encode(session_id: u32) -> [u8; HANDSHAKE_LEN] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[..4].copy_from_slice(&DATA_CONN_FLAG);
    out[4..].copy_from_slice(&session_id.to_be_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// Everything seen so far is a prefix of the magic; keep reading.
    Partial,
    /// Some byte differs from the magic.
    Mismatch,
    Data(u32),
}

pub fn inspect(buf: &[u8]) -> Prefix {
    let n = buf.len().min(DATA_CONN_FLAG.len());
    if buf[..n] != DATA_CONN_FLAG[..n] {
        return Prefix::Mismatch;
    }
    if buf.len() < HANDSHAKE_LEN {
        return Prefix::Partial;
    }
    let mut sid = &buf[DATA_CONN_FLAG.len()..HANDSHAKE_LEN];
    Prefix::Data(sid.get_u32())
}
