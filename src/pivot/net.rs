use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` for "all interfaces",
/// which `SocketAddr` parsing and the Tokio bind APIs reject, so it becomes
/// `"0.0.0.0:PORT"` here.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn expands_port_only_shorthand() {
        assert_eq!(normalize_bind_addr(":7000").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr(" :8443 ").as_ref(), "0.0.0.0:8443");
    }

    #[test]
    fn passes_through_full_addresses() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:7000").as_ref(),
            "127.0.0.1:7000"
        );
        assert_eq!(normalize_bind_addr("[::]:7000").as_ref(), "[::]:7000");
    }
}
