//! Topic exchange pattern matching.
//!
//! Routing keys are dot-separated words. In a binding pattern `*` matches
//! exactly one word and `#` matches zero or more words.

#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` swallows 0..=n words
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => matches_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("user.registration", "user.registration"));
        assert!(!topic_matches("user.registration", "user.login"));
        assert!(!topic_matches("user.registration", "user.registration.extra"));
    }

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("user.*", "user.registration"));
        assert!(topic_matches("*.registration", "user.registration"));
        assert!(!topic_matches("user.*", "user"));
        assert!(!topic_matches("user.*", "user.registration.v2"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.registration.v2"));
        assert!(topic_matches("user.#.v2", "user.registration.v2"));
        assert!(topic_matches("user.#.v2", "user.v2"));
        assert!(!topic_matches("user.#.v2", "user.registration.v1"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(topic_matches("*.#", "login"));
        assert!(topic_matches("login.*.#", "login.verification.retry"));
        assert!(!topic_matches("login.*.#", "login"));
    }
}
