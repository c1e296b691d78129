//! REST adapters for the contact-center backend
//!
//! Each module binds one backend resource to the trait the core consumes.

pub mod agent_status;
pub mod call_log;
pub mod client;
pub mod contacts;
pub mod queues;
pub mod telephony;

pub use agent_status::RestPresenceStore;
pub use call_log::RestCallLog;
pub use client::ApiClient;
pub use contacts::ContactDirectory;
pub use queues::RestQueueDirectory;
pub use telephony::TelephonyConfig;

/// Percent-encode a query string value.
pub(crate) fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Percent-encode a single path segment. Spaces become `%20` and dot
/// segments are escaped so they cannot climb the path.
pub(crate) fn segment(value: &str) -> String {
    if value == "." || value == ".." {
        return value.replace('.', "%2E");
    }
    encode(value).replace('+', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_encoding() {
        assert_eq!(segment("m 1"), "m%201");
        assert_eq!(segment("a+b/c"), "a%2Bb%2Fc");
        assert_eq!(segment(".."), "%2E%2E");
        assert_eq!(segment("agent.7"), "agent.7");
        assert_eq!(encode("m 1"), "m+1");
    }
}
