use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = frbook_common::id::prefixed_ulid("lnk");
/// assert!(id.starts_with("lnk_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One real-time link (a single connection attempt).
    pub const LINK: &str = "lnk";
    /// One call handshake on the signaling relay.
    pub const CALL: &str = "call";
}
