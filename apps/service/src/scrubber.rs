//! Stand-in for the smart HTML scrubber hasher.
//!
//! The scrubber reduces a page to the bytes that affect presentation or
//! security before hashing, so volatile markup (timestamps in comments,
//! rotating nonces in tag attributes) does not register as a content change.
//! The full routine lives outside this crate; the reduction here keeps the
//! same byte-stream-hash contract: tags and comments are dropped and
//! whitespace runs collapse to a single space.

use sha2::{Digest, Sha256};

use crate::monitoring::types::MonitorId;

/// Scrub the body and hash it, domain-separated by the monitor id exactly
/// like the plain content hash.
pub fn scrub_and_hash(monitor_id: MonitorId, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(monitor_id.to_le_bytes());
    hasher.update(scrub(body));
    hasher.finalize().into()
}

fn scrub(body: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(body.len());
    let mut in_tag = false;
    let mut last_was_space = true;

    let mut index = 0;
    while index < body.len() {
        let byte = body[index];

        if in_tag {
            if byte == b'>' {
                in_tag = false;
            }
            index += 1;
            continue;
        }

        if byte == b'<' {
            // Comments end with "-->", ordinary tags with '>'.
            if body[index..].starts_with(b"<!--") {
                match find(&body[index..], b"-->") {
                    Some(offset) => index += offset + 3,
                    None => break,
                }
            } else {
                in_tag = true;
                index += 1;
            }
            continue;
        }

        if byte.is_ascii_whitespace() {
            if !last_was_space {
                output.push(b' ');
                last_was_space = true;
            }
        } else {
            output.push(byte);
            last_was_space = false;
        }
        index += 1;
    }

    while output.last() == Some(&b' ') {
        output.pop();
    }

    output
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_changes_do_not_move_the_hash() {
        let a = b"<html><body>status:   <b>fine</b></body></html>";
        let b = b"<html data-nonce=\"17\"><body>status: <i>fine</i>\n</body></html>";
        assert_eq!(scrub_and_hash(3, a), scrub_and_hash(3, b));
    }

    #[test]
    fn text_changes_move_the_hash() {
        let a = b"<body>status: fine</body>";
        let b = b"<body>status: down</body>";
        assert_ne!(scrub_and_hash(3, a), scrub_and_hash(3, b));
    }

    #[test]
    fn comments_are_dropped() {
        let a = b"before <!-- generated 2023-01-01 --> after";
        let b = b"before <!-- generated 2023-06-30 --> after";
        assert_eq!(scrub_and_hash(1, a), scrub_and_hash(1, b));
    }

    #[test]
    fn hash_is_monitor_scoped() {
        let body = b"<p>same body</p>";
        assert_ne!(scrub_and_hash(1, body), scrub_and_hash(2, body));
    }
}
