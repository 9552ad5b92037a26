//! Password decoding.
//!
//! Pools can store an encoded password and run it through a
//! [`PasswordDecoder`] at session-creation time. Decoders are
//! registered by name so configuration files can refer to them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Result;

/// A string that redacts its contents in `Debug` and `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Access the underlying value.
    pub fn expose(&self) -> &str {
        &self.inner
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureString(***)")
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Decodes an encoded password into its cleartext form.
pub trait PasswordDecoder: Send + Sync {
    /// Decode `encoded` into the password handed to the driver.
    fn decode(&self, encoded: &str) -> Result<SecureString>;
}

/// Rot13 decoder.
///
/// The algorithm offers no real secrecy; it exists as the stock
/// example of the decoder plug-in point.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotDecoder;

impl PasswordDecoder for RotDecoder {
    fn decode(&self, encoded: &str) -> Result<SecureString> {
        let rotated: String = encoded
            .chars()
            .map(|c| match c {
                'A'..='Z' => (b'A' + (c as u8 - b'A' + 13) % 26) as char,
                'a'..='z' => (b'a' + (c as u8 - b'a' + 13) % 26) as char,
                _ => c,
            })
            .collect();
        Ok(SecureString::new(rotated))
    }
}

static DECODERS: Lazy<RwLock<HashMap<String, Arc<dyn PasswordDecoder>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn PasswordDecoder>> = HashMap::new();
    map.insert("rot13".to_owned(), Arc::new(RotDecoder));
    RwLock::new(map)
});

/// Register a decoder under a name for use from configuration files.
pub fn register_decoder(name: impl Into<String>, decoder: Arc<dyn PasswordDecoder>) {
    DECODERS.write().insert(name.into(), decoder);
}

/// Look up a decoder by its registered name.
pub fn decoder_by_name(name: &str) -> Option<Arc<dyn PasswordDecoder>> {
    DECODERS.read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rot13_round_trips() {
        let decoder = RotDecoder;
        let once = decoder.decode("Gvtre!123").unwrap();
        assert_eq!(once.expose(), "Tiger!123");
        let twice = decoder.decode(once.expose()).unwrap();
        assert_eq!(twice.expose(), "Gvtre!123");
    }

    #[test]
    fn secure_string_redacts_debug_output() {
        let secret = SecureString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecureString(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn builtin_rot13_is_registered() {
        assert!(decoder_by_name("rot13").is_some());
        assert!(decoder_by_name("missing").is_none());
    }
}
