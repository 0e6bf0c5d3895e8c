//! Log redaction helpers.
//!
//! Key material never reaches the log layer at all; these wrappers cover
//! the remaining cases where a value is safe to mention but not to print
//! in full, such as peer addresses and opaque byte blobs.

use std::fmt;

/// Displays a byte slice as its length only.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Displays a peer address abbreviated to its first and last characters.
///
/// Hidden-service addresses are long-lived identifiers; full addresses in
/// logs make log files linkable to peers.
pub struct ShortAddr<'a>(pub &'a str);

impl fmt::Display for ShortAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 16 {
            write!(f, "{}...{}", &s[..6], &s[s.len() - 6..])
        } else {
            write!(f, "{}", s)
        }
    }
}

impl fmt::Debug for ShortAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
