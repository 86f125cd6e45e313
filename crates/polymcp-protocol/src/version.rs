//! Protocol version negotiation.

/// Protocol revisions this runtime speaks, oldest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// The newest supported revision.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Version assumed when a client omits `Mcp-Protocol-Version`.
pub const DEFAULT_NEGOTIATED_PROTOCOL_VERSION: &str = "2025-03-26";

/// Pick the version to answer `initialize` with.
///
/// If the client's requested version is supported it wins; otherwise the
/// server answers with the latest version it speaks and the client decides
/// whether to proceed.
pub fn negotiate_protocol_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

/// True when the given version string is one this runtime speaks.
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
