//! Subject pattern matching with NATS wildcards

/// Match `subject` against a NATS-style pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_parts: Vec<&str> = subject.split('.').collect();
    let pattern_parts: Vec<&str> = pattern.split('.').collect();

    let mut si = 0;
    let mut pi = 0;

    while pi < pattern_parts.len() {
        let pp = pattern_parts[pi];

        if pp == ">" {
            return si < subject_parts.len();
        }

        if si >= subject_parts.len() {
            return false;
        }

        if pp != "*" && pp != subject_parts[si] {
            return false;
        }

        si += 1;
        pi += 1;
    }

    si == subject_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(subject_matches("cdc.net1_gwstatus", "cdc.>"));
        assert!(subject_matches("cdc.net1_gwstatus", "cdc.*"));
        assert!(subject_matches("gateway_view_updates", "gateway_view_updates"));
        assert!(!subject_matches("cdc", "cdc.>"));
        assert!(!subject_matches("other.net1_gwstatus", "cdc.>"));
        assert!(!subject_matches("cdc.a.b", "cdc.*"));
    }
}
