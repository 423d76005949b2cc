//! RFC 2818 / RFC 6125 style hostname matching
//!
//! Both the name and the certificate template are normalised before they are
//! compared: punycode (`xn--`) labels are decoded to Unicode and everything is
//! lowercased. A `*` in a template label matches any run of characters inside
//! that single label, never across a dot.

/// Placeholder substituted for `*` when checking template syntax
const WILDCARD_PLACEHOLDER: char = 'z';

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Decode punycode labels and lowercase the result
fn normalize(name: &str) -> String {
    name.split('.')
        .map(|label| {
            let lower = label.to_lowercase();
            match lower.strip_prefix("xn--") {
                Some(encoded) => idna::punycode::decode_to_string(encoded).unwrap_or(lower),
                None => lower,
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// A template whose wildcard is not followed by at least one more label
///
/// Rejects `*`, `*.`, `*com`, `foo.*` and similar.
pub fn has_illegal_wildcard(template: &str) -> bool {
    let Some(pos) = template.rfind('*') else {
        return false;
    };
    let after = &template[pos + 1..];
    match after.find('.') {
        None => true,
        Some(dot) => after[dot + 1..].is_empty(),
    }
}

/// Syntactic DNS name check over already-normalised input
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    })
}

fn label_matches(name_label: &str, template_label: &str) -> bool {
    match template_label.split_once('*') {
        None => name_label == template_label,
        Some((prefix, suffix)) => {
            name_label.len() >= prefix.len() + suffix.len()
                && name_label.starts_with(prefix)
                && name_label.ends_with(suffix)
        }
    }
}

/// Whether `name` is covered by the certificate identity `template`
pub fn is_matched(name: &str, template: &str) -> bool {
    let name = normalize(name);
    let template = normalize(template);

    if name.is_empty() || template.is_empty() || has_illegal_wildcard(&template) {
        return false;
    }

    let substituted = template.replace('*', &WILDCARD_PLACEHOLDER.to_string());
    if !is_valid_dns_name(&substituted) {
        return false;
    }

    let name_labels: Vec<&str> = name.split('.').collect();
    let template_labels: Vec<&str> = template.split('.').collect();
    if name_labels.len() != template_labels.len() {
        return false;
    }

    name_labels
        .iter()
        .zip(template_labels.iter())
        .all(|(n, t)| label_matches(n, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_single_label() {
        assert!(is_matched("foo.a.com", "*.a.com"));
        assert!(!is_matched("bar.foo.a.com", "*.a.com"));
        assert!(!is_matched("a.com", "*.a.com"));
    }

    #[test]
    fn test_partial_wildcard() {
        assert!(is_matched("foo.com", "f*.com"));
        assert!(!is_matched("bar.com", "f*.com"));
        assert!(is_matched("api-eu.example.com", "api-*.example.com"));
        assert!(is_matched("web1.example.com", "*1.example.com"));
        assert!(!is_matched("web2.example.com", "*1.example.com"));
        // prefix and suffix may not overlap
        assert!(!is_matched("ab.com", "ab*b.com"));
    }

    #[test]
    fn test_illegal_wildcards_rejected() {
        for template in ["*", "*.", "*com", "foo.*", "a.b*"] {
            assert!(has_illegal_wildcard(template), "{template}");
            assert!(!is_matched("com", template));
            assert!(!is_matched("foo.com", template));
            assert!(!is_matched("a.bc", template));
        }
        assert!(!has_illegal_wildcard("*.a.com"));
        assert!(!has_illegal_wildcard("exact.example.com"));
    }

    #[test]
    fn test_exact_match_case_insensitive() {
        assert!(is_matched("API.Example.COM", "api.example.com"));
        assert!(is_matched("api.example.com", "*.EXAMPLE.com"));
        assert!(!is_matched("api.example.org", "api.example.com"));
    }

    #[test]
    fn test_invalid_template_syntax() {
        assert!(!is_matched("foo.com", "foo..com"));
        assert!(!is_matched("foo.com", "-foo.com"));
        assert!(!is_matched("foo bar.com", "foo bar.com"));
    }

    #[test]
    fn test_idn_round_trip() {
        // bücher.example in punycode
        assert!(is_matched("xn--bcher-kva.example", "bücher.example"));
        assert!(is_matched("bücher.example", "xn--bcher-kva.example"));
        assert!(is_matched("bücher.example", "*.example"));
    }
}
