/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Credential sourcing for connection attempts, including MQTT5 enhanced authentication.

A provider is asked for credentials every time the client builds a CONNECT packet, so
rotating secrets are picked up on reconnect without rebuilding the client.
 */

use crate::error::{MqttifyError, MqttifyResult};

use std::fmt;

/// Username and password to place in a CONNECT packet
#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct Credentials {

    /// Username to connect with
    pub username: Option<String>,

    /// Password to connect with.  Binary data is allowed.
    pub password: Option<Vec<u8>>,
}

impl Credentials {

    /// Creates a credentials value from a username and an optional password
    pub fn new(username: &str, password: Option<&[u8]>) -> Self {
        Credentials {
            username: Some(username.to_string()),
            password: password.map(|bytes| bytes.to_vec()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials {{ username: {:?}, password: ", self.username)?;
        if self.password.is_some() {
            write!(f, "<redacted> }}")
        } else {
            write!(f, "None }}")
        }
    }
}

/// Source of authentication material for connection attempts.
///
/// Only `credentials` is required.  The remaining methods drive MQTT5 enhanced authentication:
/// when `auth_method` returns a value it is sent in the CONNECT packet along with
/// `initial_auth_data`, and every AUTH packet the broker sends with a
/// `ContinueAuthentication` or `ReAuthenticate` reason is answered with the data returned by
/// `on_auth_challenge`.
pub trait CredentialsProvider : Send + Sync {

    /// Queried on every connection attempt.
    fn credentials(&self) -> MqttifyResult<Credentials>;

    /// Enhanced authentication method name, if any
    fn auth_method(&self) -> Option<String> {
        None
    }

    /// Authentication data to include in the CONNECT packet
    fn initial_auth_data(&self) -> Option<Vec<u8>> {
        None
    }

    /// Computes the response to a broker authentication challenge.
    fn on_auth_challenge(&self, _server_data: Option<&[u8]>) -> MqttifyResult<Option<Vec<u8>>> {
        Err(MqttifyError::new_protocol_violation("broker sent an authentication challenge but no enhanced authentication is configured"))
    }
}

/// Provider that always hands out the same username and password.
#[derive(Clone, Debug, Default)]
pub struct BasicCredentialsProvider {
    credentials: Credentials,
}

impl BasicCredentialsProvider {

    /// Creates a provider for a fixed username and optional password
    pub fn new(username: &str, password: Option<&[u8]>) -> Self {
        BasicCredentialsProvider {
            credentials: Credentials::new(username, password)
        }
    }

    pub(crate) fn from_credentials(credentials: Credentials) -> Self {
        BasicCredentialsProvider {
            credentials
        }
    }
}

impl CredentialsProvider for BasicCredentialsProvider {
    fn credentials(&self) -> MqttifyResult<Credentials> {
        Ok(self.credentials.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn basic_provider_returns_fixed_credentials() {
        let provider = BasicCredentialsProvider::new("user", Some("secret".as_bytes()));

        let credentials = provider.credentials().unwrap();
        assert_eq!(Some("user".to_string()), credentials.username);
        assert_eq!(Some("secret".as_bytes().to_vec()), credentials.password);
        assert_eq!(credentials, provider.credentials().unwrap());
    }

    #[test]
    fn basic_provider_rejects_auth_challenges() {
        let provider = BasicCredentialsProvider::new("user", None);

        assert_eq!(None, provider.auth_method());
        assert_matches!(provider.on_auth_challenge(Some(&[1, 2, 3])), Err(MqttifyError::ProtocolViolation(_)));
    }

    #[test]
    fn debug_output_hides_password() {
        let credentials = Credentials::new("user", Some("hunter2".as_bytes()));
        let formatted = format!("{:?}", credentials);

        assert!(formatted.contains("user"));
        assert!(!formatted.contains("hunter2"));
        assert!(!formatted.contains("104"));
    }
}
