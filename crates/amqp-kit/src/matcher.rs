//! Routing key matching for queues shared by several routes.

const DELIMITER: char = '.';
const MATCH_WORD: &str = "*";
const MATCH_REST: &str = "#";

/// Check whether a routing key matches a topic pattern.
///
/// `*` matches exactly one segment. `#` matches whatever follows it, so the
/// pattern segments after a `#` are not inspected. A pattern with more
/// segments than the key never matches, and a pattern that runs out before
/// the key does matches as a prefix.
#[must_use]
pub fn matches(key: &str, pattern: &str) -> bool {
    let key_segments: Vec<&str> = key.split(DELIMITER).collect();
    let pattern_segments: Vec<&str> = pattern.split(DELIMITER).collect();

    if pattern_segments.len() > key_segments.len() {
        return false;
    }

    for (segment, pattern_segment) in key_segments.iter().zip(&pattern_segments) {
        match *pattern_segment {
            MATCH_WORD => {}
            MATCH_REST => return true,
            literal => {
                if literal != *segment {
                    return false;
                }
            }
        }
    }

    true
}
