//! Hostname canonicalization and wildcard keys.
//!
//! Every routing lookup uses the canonical form of the requested name:
//! lowercase, no trailing dot. A subdomain family can be served by a single
//! backend registered under the wildcard form, where the first label is
//! replaced by [`WILDCARD_LABEL`] (`foo.example.com` -> `_.example.com`).

use std::fmt;

use crate::error::HostnameError;

/// Label substituted for the first label of a hostname in its wildcard form.
pub const WILDCARD_LABEL: &str = "_";

/// A validated, normalized hostname.
///
/// Always non-empty, lowercase, without a trailing dot, and free of `/`,
/// so it can be used directly as a file name inside a socket directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalHostname(String);

impl CanonicalHostname {
    /// Validate and normalize a hostname.
    pub fn new(hostname: &str) -> Result<Self, HostnameError> {
        canonicalize(hostname)
    }

    /// The wildcard form of this hostname.
    pub fn wildcard(&self) -> String {
        wildcard(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalHostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalHostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate and normalize a hostname.
///
/// Fails if the name is empty, starts with `.`, contains `/`, or would still
/// end in `.` after one trailing dot is stripped (`"a.."`). Otherwise the
/// name is lowercased and a single trailing dot removed.
pub fn canonicalize(hostname: &str) -> Result<CanonicalHostname, HostnameError> {
    let invalid = || HostnameError::Invalid(hostname.to_string());

    if hostname.is_empty() || hostname.starts_with('.') || hostname.contains('/') {
        return Err(invalid());
    }

    let lowered = hostname.to_lowercase();
    let stripped = lowered.strip_suffix('.').unwrap_or(&lowered);

    if stripped.is_empty() || stripped.ends_with('.') {
        return Err(invalid());
    }

    Ok(CanonicalHostname(stripped.to_string()))
}

/// Replace the first dot-delimited label with [`WILDCARD_LABEL`].
///
/// A name without any dot becomes the wildcard label itself.
pub fn wildcard(hostname: &str) -> String {
    replace_first_label(hostname, WILDCARD_LABEL)
}

fn replace_first_label(hostname: &str, replacement: &str) -> String {
    match hostname.find('.') {
        Some(dot) => format!("{}{}", replacement, &hostname[dot..]),
        None => replacement.to_string(),
    }
}
