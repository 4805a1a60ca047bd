//! Credentials that identify an environment.
//!
//! Three kinds are recognized, each with a fixed shape:
//!
//! ```text
//! server key      sdk-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
//! mobile key      mob-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
//! client-side id  24 hexadecimal characters
//! ```
//!
//! Parsing trims surrounding whitespace and otherwise compares exactly.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const SERVER_KEY_PREFIX: &str = "sdk-";
const MOBILE_KEY_PREFIX: &str = "mob-";
const HYPHENATED_UUID_LEN: usize = 36;
const CLIENT_SIDE_ID_LEN: usize = 24;

// Schemes some SDKs put in front of the key in the Authorization header.
const AUTHORIZATION_SCHEMES: &[&str] = &["api_key ", "bearer "];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Server,
    Mobile,
    ClientSide,
}

impl CredentialKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Server => "server",
            CredentialKind::Mobile => "mobile",
            CredentialKind::ClientSide => "client_side",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("credential is empty")]
    Empty,
    #[error("credential does not match any known format")]
    Malformed,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    kind: CredentialKind,
    value: Arc<str>,
}

impl Credential {
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(CredentialError::Empty);
        }

        let kind = if let Some(rest) = value.strip_prefix(SERVER_KEY_PREFIX) {
            is_hyphenated_uuid(rest).then_some(CredentialKind::Server)
        } else if let Some(rest) = value.strip_prefix(MOBILE_KEY_PREFIX) {
            is_hyphenated_uuid(rest).then_some(CredentialKind::Mobile)
        } else if value.len() == CLIENT_SIDE_ID_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
        {
            Some(CredentialKind::ClientSide)
        } else {
            None
        };

        kind.map(|kind| Credential {
            kind,
            value: value.into(),
        })
        .ok_or(CredentialError::Malformed)
    }

    /// Parses the value of an `Authorization` header, with or without a scheme.
    pub fn from_authorization(header_value: &str) -> Result<Self, CredentialError> {
        let value = header_value.trim();
        let token = AUTHORIZATION_SCHEMES
            .iter()
            .find_map(|scheme| {
                value
                    .get(..scheme.len())
                    .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                    .map(|_| &value[scheme.len()..])
            })
            .unwrap_or(value);

        Self::parse(token)
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Last four characters only, safe to log or report.
    pub fn masked(&self) -> String {
        // Every accepted shape is ASCII, so byte slicing is on a char boundary.
        let tail = &self.value[self.value.len().saturating_sub(4)..];
        format!("...{tail}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("value", &self.masked())
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} credential {}", self.kind.as_str(), self.masked())
    }
}

fn is_hyphenated_uuid(s: &str) -> bool {
    s.len() == HYPHENATED_UUID_LEN && Uuid::try_parse(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        let server = Credential::parse("sdk-11111111-1111-4111-a111-111111111111").unwrap();
        assert_eq!(server.kind(), CredentialKind::Server);

        let mobile = Credential::parse("mob-ffffffff-ffff-4fff-afff-ffffffffffff").unwrap();
        assert_eq!(mobile.kind(), CredentialKind::Mobile);

        let client_side = Credential::parse("0123456789abcdef01234567").unwrap();
        assert_eq!(client_side.kind(), CredentialKind::ClientSide);
    }

    #[test]
    fn test_parse_trims_whitespace_only() {
        let credential = Credential::parse("  0123456789abcdef01234567\n").unwrap();
        assert_eq!(credential.as_str(), "0123456789abcdef01234567");

        // No case folding: the value is kept as given
        let upper = Credential::parse("0123456789ABCDEF01234567").unwrap();
        assert_ne!(upper, credential);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Credential::parse(""), Err(CredentialError::Empty));
        assert_eq!(Credential::parse("   "), Err(CredentialError::Empty));

        for raw in [
            "blah",
            "sdk-",
            "sdk-not-a-uuid",
            "sdk-111111111111411-1a111-111111111111",
            "mob-ffffffffffff4fffafffffffffffffff",
            "key-ffffffff-ffff-4fff-afff-ffffffffffff",
            "0123456789abcdef0123456",
            "0123456789abcdef012345678",
            "0123456789abcdef0123456z",
        ] {
            assert_eq!(
                Credential::parse(raw),
                Err(CredentialError::Malformed),
                "{raw:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_from_authorization() {
        let expected = Credential::parse("sdk-11111111-1111-4111-a111-111111111111").unwrap();

        for header in [
            "sdk-11111111-1111-4111-a111-111111111111",
            "api_key sdk-11111111-1111-4111-a111-111111111111",
            "Bearer sdk-11111111-1111-4111-a111-111111111111",
            "bearer  sdk-11111111-1111-4111-a111-111111111111 ",
        ] {
            assert_eq!(Credential::from_authorization(header), Ok(expected.clone()));
        }

        assert_eq!(
            Credential::from_authorization("Basic dXNlcjpwYXNz"),
            Err(CredentialError::Malformed)
        );
    }

    #[test]
    fn test_masking() {
        let credential = Credential::parse("mob-ffffffff-ffff-4fff-afff-ffffffff1234").unwrap();
        assert_eq!(credential.masked(), "...1234");
        assert!(!format!("{credential:?}").contains("ffffffff-ffff"));
        assert_eq!(credential.to_string(), "mobile credential ...1234");
    }
}
