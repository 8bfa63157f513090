//! Basic-auth credential validation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ProxyError;

const EXPECTED_FORMAT: &str = "Expected 'username:password'";
const EMPTY_CREDENTIAL: &str = "Username and password must not be empty";

/// A validated `username:password` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Split `user:pass` around exactly one colon; both halves must be non-empty.
    pub fn parse(auth: &str) -> Result<Self, ProxyError> {
        let mut parts = auth.split(':');
        let (username, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(pass), None) => (user, pass),
            _ => return Err(ProxyError::InvalidAuthFormat(EXPECTED_FORMAT)),
        };
        if username.is_empty() || password.is_empty() {
            return Err(ProxyError::InvalidAuthFormat(EMPTY_CREDENTIAL));
        }
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Value for an `authorization` header.
    pub fn basic_header(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }
}
