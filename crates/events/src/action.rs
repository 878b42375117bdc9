//! The closed action vocabulary and the end-of-stream token.

use thiserror::Error;

pub const USER_REGISTERED: &str = "UserRegistered";
pub const USER_UPDATED: &str = "UserUpdated";
pub const USER_DELETED: &str = "UserDeleted";

/// Externally configured action value meaning "no more events available
/// right now".
///
/// This is a transport liveness signal, never a domain mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfStreamToken(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("end-of-stream token must not be empty")]
pub struct EmptyToken;

impl EndOfStreamToken {
    pub fn new(token: impl Into<String>) -> Result<Self, EmptyToken> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(EmptyToken);
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What an envelope's action tag means.
///
/// Adding a domain action means adding a variant here, which every dispatcher
/// must then handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action<'a> {
    UserRegistered,
    UserUpdated,
    UserDeleted,
    EndOfStream,
    Unrecognized(&'a str),
}

impl<'a> Action<'a> {
    /// Classify a raw action tag. The end-of-stream token wins over any
    /// domain name.
    pub fn classify(tag: &'a str, eos: &EndOfStreamToken) -> Self {
        if tag == eos.as_str() {
            return Action::EndOfStream;
        }
        match tag {
            USER_REGISTERED => Action::UserRegistered,
            USER_UPDATED => Action::UserUpdated,
            USER_DELETED => Action::UserDeleted,
            other => Action::Unrecognized(other),
        }
    }

    pub fn name(&self) -> &'a str {
        match *self {
            Action::UserRegistered => USER_REGISTERED,
            Action::UserUpdated => USER_UPDATED,
            Action::UserDeleted => USER_DELETED,
            Action::EndOfStream => "EndOfStream",
            Action::Unrecognized(tag) => tag,
        }
    }
}

impl core::fmt::Display for Action<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eos() -> EndOfStreamToken {
        EndOfStreamToken::new("__EOS__").unwrap()
    }

    #[test]
    fn classifies_domain_actions() {
        assert_eq!(Action::classify("UserRegistered", &eos()), Action::UserRegistered);
        assert_eq!(Action::classify("UserUpdated", &eos()), Action::UserUpdated);
        assert_eq!(Action::classify("UserDeleted", &eos()), Action::UserDeleted);
    }

    #[test]
    fn sentinel_is_end_of_stream() {
        assert_eq!(Action::classify("__EOS__", &eos()), Action::EndOfStream);
    }

    #[test]
    fn sentinel_takes_precedence_over_domain_names() {
        let token = EndOfStreamToken::new(USER_DELETED).unwrap();
        assert_eq!(Action::classify(USER_DELETED, &token), Action::EndOfStream);
    }

    #[test]
    fn anything_else_is_unrecognized() {
        assert_eq!(Action::classify("Bogus", &eos()), Action::Unrecognized("Bogus"));
        assert_eq!(Action::classify("userregistered", &eos()), Action::Unrecognized("userregistered"));
    }

    #[test]
    fn empty_token_is_rejected() {
        assert_eq!(EndOfStreamToken::new("  "), Err(EmptyToken));
    }
}
