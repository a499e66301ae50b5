//! Deterministic Kubernetes names for synchronized resources.
//!
//! Director names are free-form, so they're mapped onto DNS-1123 labels. A
//! name that is already a valid label is used verbatim; anything else is
//! sanitized and suffixed with a short hash of the original so that distinct
//! inputs can't collapse onto the same name.

use sha2::{Digest, Sha256};
use std::fmt::Write;

const MAX_LEN: usize = 63;
const HASH_LEN: usize = 8;

pub fn application_name(display_name: &str) -> String {
    dns_label(display_name)
}

/// Names the secret holding a service's credentials.
pub fn credentials_secret_name(application: &str, service_id: &str) -> String {
    dns_label(&format!("{application}-{service_id}"))
}

/// Names the secret holding a service's extra headers and query parameters.
pub fn request_parameters_secret_name(application: &str, service_id: &str) -> String {
    dns_label(&format!("params-{application}-{service_id}"))
}

pub fn service_name(display_name: &str) -> String {
    dns_label(display_name)
}

pub fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

fn dns_label(raw: &str) -> String {
    if is_dns_label(raw) {
        return raw.to_string();
    }

    let mut base = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            base.push(c);
        } else if !base.is_empty() && !base.ends_with('-') {
            base.push('-');
        }
    }
    base.truncate(MAX_LEN - HASH_LEN - 1);
    let base = base.trim_end_matches('-');

    let hash = short_hash(raw);
    if base.is_empty() {
        hash
    } else {
        format!("{base}-{hash}")
    }
}

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in &digest[..HASH_LEN / 2] {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_labels_are_kept() {
        assert_eq!(application_name("billing"), "billing");
        assert_eq!(
            credentials_secret_name("billing", "0b5e8a52"),
            "billing-0b5e8a52"
        );
        assert_eq!(
            request_parameters_secret_name("billing", "svc"),
            "params-billing-svc"
        );
    }

    #[test]
    fn invalid_names_are_sanitized_and_hashed() {
        let name = application_name("Billing");
        assert!(name.starts_with("billing-"), "{name}");
        assert_eq!(name.len(), "billing-".len() + HASH_LEN);
        assert!(is_dns_label(&name));

        assert_eq!(application_name("Billing"), name, "naming is deterministic");
        assert_ne!(application_name("BILLING"), name, "distinct inputs stay distinct");
    }

    #[test]
    fn long_names_are_truncated() {
        let raw = "My Very Long Application Name ".repeat(5);
        let name = application_name(&raw);
        assert!(name.len() <= MAX_LEN);
        assert!(is_dns_label(&name), "{name}");
    }

    #[test]
    fn unusable_names_reduce_to_the_hash() {
        let name = application_name("___");
        assert_eq!(name.len(), HASH_LEN);
        assert!(is_dns_label(&name));
    }
}
