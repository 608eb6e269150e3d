//! The [`Secret`] wrapper.
use std::fmt;

/// Holder for credential material.
///
/// Formatting a `Secret` with `Debug` or `Display` always prints a fixed
/// redaction string, so a diagnostic dump of a [`Config`][crate::Config]
/// or a session never exposes the password or TLS key material.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<T>(T);

const REDACTED: &str = "<redacted>";

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Read the wrapped value. Deliberately not a `Deref` impl, every
    /// use site names the exposure.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}
