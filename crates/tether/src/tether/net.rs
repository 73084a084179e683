use std::{borrow::Cow, io, time::Duration};

/// How long an accept loop backs off after a listener-level failure.
pub const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Normalize a bind/listen address.
///
/// Configs use the shorthand `":PORT"` for "all interfaces"; tokio's bind
/// APIs do not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Joins a host and port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Host part of a `host:port` address (brackets stripped for IPv6).
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map(|(h, _)| h).unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((h, _)) if !h.contains(':') => h,
        Some(_) => addr,
        None => addr,
    }
}

/// Pause an accept loop should take after `err`.
///
/// Errors tied to a single aborted connection are retried at once.
pub fn accept_error_pause(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_ERROR_PAUSE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("0.0.0.0", 9000), "0.0.0.0:9000");
        assert_eq!(join_host_port("::1", 9000), "[::1]:9000");
        assert_eq!(join_host_port("[::1]", 9000), "[::1]:9000");
        assert_eq!(join_host_port("example.com", 0), "example.com:0");
    }

    #[test]
    fn host_of_strips_port() {
        assert_eq!(host_of("tunnel.example.com:7000"), "tunnel.example.com");
        assert_eq!(host_of("127.0.0.1:7000"), "127.0.0.1");
        assert_eq!(host_of("[::1]:7000"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn accept_errors_pause_unless_per_connection() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_error_pause(&aborted), None);

        // EMFILE
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_error_pause(&exhausted), Some(ACCEPT_ERROR_PAUSE));
    }
}
