//! Validation of caller-supplied access-key credentials

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ACCESS_KEY_AUTH: &str = "access_key";

/// Credential fields as they arrive on a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_auth_method")]
    pub auth_method: String,

    #[serde(default)]
    pub aws_access_key_id: Option<String>,

    #[serde(default)]
    pub aws_secret_access_key: Option<String>,

    #[serde(default)]
    pub aws_session_token: Option<String>,
}

impl Default for CredentialsRequest {
    fn default() -> Self {
        Self {
            profile: None,
            region: default_region(),
            auth_method: default_auth_method(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_auth_method() -> String {
    ACCESS_KEY_AUTH.to_string()
}

/// Credentials that passed validation
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl CredentialsRequest {
    /// Validate and normalize the request
    ///
    /// Whitespace is trimmed from every field. Temporary keys (`ASIA...`)
    /// must carry a session token.
    pub fn validate(&self) -> Result<Credentials> {
        if self.auth_method != ACCESS_KEY_AUTH {
            return Err(Error::InvalidCredentials(
                "Only access_key authentication is supported. Please provide aws_access_key_id and aws_secret_access_key.".to_string(),
            ));
        }

        let access_key_id = trimmed(&self.aws_access_key_id);
        let secret_access_key = trimmed(&self.aws_secret_access_key);
        let session_token = trimmed(&self.aws_session_token);

        if let Some(key) = &access_key_id {
            if key.starts_with("ASIA") && session_token.is_none() {
                return Err(Error::InvalidCredentials(
                    "Temporary credentials detected (ASIA...). Session token is required."
                        .to_string(),
                ));
            }
        }

        match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Credentials {
                region: self.region.trim().to_string(),
                access_key_id,
                secret_access_key,
                session_token,
            }),
            _ => Err(Error::InvalidCredentials(
                "access_key requires aws_access_key_id and aws_secret_access_key".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: Option<&str>, secret: Option<&str>, token: Option<&str>) -> CredentialsRequest {
        CredentialsRequest {
            aws_access_key_id: key.map(str::to_string),
            aws_secret_access_key: secret.map(str::to_string),
            aws_session_token: token.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_credentials_are_trimmed() {
        let credentials = request(Some("  AKIAEXAMPLE "), Some("secret\n"), Some("   "))
            .validate()
            .unwrap();

        assert_eq!(credentials.access_key_id, "AKIAEXAMPLE");
        assert_eq!(credentials.secret_access_key, "secret");
        assert_eq!(credentials.session_token, None);
        assert_eq!(credentials.region, "us-east-1");
    }

    #[test]
    fn test_temporary_key_requires_session_token() {
        let err = request(Some("ASIAEXAMPLE"), Some("secret"), None)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)));
        assert!(err.to_string().contains("Session token is required"));

        assert!(request(Some("ASIAEXAMPLE"), Some("secret"), Some("token"))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let err = request(Some("AKIAEXAMPLE"), Some("  "), None)
            .validate()
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("requires aws_access_key_id and aws_secret_access_key"));
    }

    #[test]
    fn test_other_auth_methods_are_rejected() {
        let mut req = request(Some("AKIAEXAMPLE"), Some("secret"), None);
        req.auth_method = "profile".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = request(Some("AKIAEXAMPLE"), Some("hunter2"), Some("tok"))
            .validate()
            .unwrap();
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("\"tok\""));
    }
}
