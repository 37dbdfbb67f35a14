//! Per-session options
//!
//! Options can be built in code with the `with_*` methods or deserialized from
//! JSON using the same snake_case field names.

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{Result, TlsError};

/// TLS protocol versions the engine can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum ProtocolVersion {
    /// TLS 1.2
    #[serde(rename = "tls12", alias = "TLSv1.2", alias = "1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "tls13", alias = "TLSv1.3", alias = "1.3")]
    Tls13,
}

impl ProtocolVersion {
    pub(crate) fn engine_version(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => write!(f, "TLSv1.2"),
            Self::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// Options recognized by [`crate::Session`]
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Certificate chain file, leaf first
    pub certificate_file: Option<PathBuf>,
    /// Private key file matching the leaf certificate
    pub key_file: Option<PathBuf>,
    /// Password for an encrypted private key
    #[serde(deserialize_with = "deserialize_secret")]
    pub key_password: Option<SecretString>,
    /// Trust anchors for peer verification
    pub ca_file: Option<PathBuf>,
    /// Certificate revocation lists applied during peer verification
    pub crl_file: Option<PathBuf>,
    /// DH parameter file; servers use it instead of the generated set
    pub dh_params_file: Option<PathBuf>,
    /// Offer finite-field DH with the generated parameter set (servers)
    pub dh_key_exchange: bool,
    /// Check the peer certificate in `verify()` and, on servers, request one
    pub verify_peer: bool,
    /// Lowest protocol version offered
    pub min_version: Option<ProtocolVersion>,
    /// Highest protocol version offered
    pub max_version: Option<ProtocolVersion>,
    /// Cipher suite names in preference order; unnamed suites are not offered
    pub cipher_priority: Vec<String>,
}

fn deserialize_secret<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("certificate_file", &self.certificate_file)
            .field("key_file", &self.key_file)
            .field(
                "key_password",
                &self.key_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ca_file", &self.ca_file)
            .field("crl_file", &self.crl_file)
            .field("dh_params_file", &self.dh_params_file)
            .field("dh_key_exchange", &self.dh_key_exchange)
            .field("verify_peer", &self.verify_peer)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_priority", &self.cipher_priority)
            .finish()
    }
}

impl SessionOptions {
    /// Options with every field unset
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON object
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Configuration`] for malformed JSON, unknown keys or
    /// values of the wrong type.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| TlsError::Configuration(format!("Invalid session options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Set the certificate chain and private key files
    #[must_use]
    pub fn with_certificate(
        mut self,
        certificate_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Self {
        self.certificate_file = Some(certificate_file.as_ref().to_path_buf());
        self.key_file = Some(key_file.as_ref().to_path_buf());
        self
    }

    /// Set the private key password
    #[must_use]
    pub fn with_key_password(mut self, password: impl Into<String>) -> Self {
        self.key_password = Some(SecretString::from(password.into()));
        self
    }

    /// Set the trust anchor file
    #[must_use]
    pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the revocation list file
    #[must_use]
    pub fn with_crl_file(mut self, path: impl AsRef<Path>) -> Self {
        self.crl_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use DH parameters from a file
    #[must_use]
    pub fn with_dh_params_file(mut self, path: impl AsRef<Path>) -> Self {
        self.dh_params_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Offer finite-field DH with the generated parameter set
    #[must_use]
    pub fn with_dh_key_exchange(mut self, enabled: bool) -> Self {
        self.dh_key_exchange = enabled;
        self
    }

    /// Enable or disable peer verification
    #[must_use]
    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Restrict the negotiated protocol version range
    #[must_use]
    pub fn with_versions(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set cipher suite preference order
    #[must_use]
    pub fn with_cipher_priority<I, S>(mut self, suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher_priority = suites.into_iter().map(Into::into).collect();
        self
    }

    /// Check that the options are internally consistent
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Configuration`] if only one of certificate and key
    /// is set or the version range is empty.
    pub fn validate(&self) -> Result<()> {
        if self.certificate_file.is_some() != self.key_file.is_some() {
            return Err(TlsError::Configuration(
                "certificate_file and key_file must be set together".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(TlsError::Configuration(format!(
                    "min_version {min} is above max_version {max}"
                )));
            }
        }
        Ok(())
    }

    /// Protocol versions allowed by `min_version` and `max_version`
    pub(crate) fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        let min = self.min_version.unwrap_or(ProtocolVersion::Tls12);
        let max = self.max_version.unwrap_or(ProtocolVersion::Tls13);
        [ProtocolVersion::Tls13, ProtocolVersion::Tls12]
            .into_iter()
            .filter(|v| *v >= min && *v <= max)
            .map(ProtocolVersion::engine_version)
            .collect()
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.key_password.as_ref().map(|p| p.expose_secret())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_options_parse_and_redact_password() {
        let options = SessionOptions::from_json(
            r#"{
                "certificate_file": "server.pem",
                "key_file": "server.key",
                "key_password": "hunter2",
                "verify_peer": true,
                "min_version": "tls13",
                "cipher_priority": ["TLS13_AES_256_GCM_SHA384"]
            }"#,
        )
        .expect("options should parse");

        assert_eq!(options.password(), Some("hunter2"));
        assert!(options.verify_peer);
        assert_eq!(options.min_version, Some(ProtocolVersion::Tls13));
        assert_eq!(options.protocol_versions().len(), 1);
        assert!(!format!("{options:?}").contains("hunter2"));
    }

    #[test]
    fn certificate_without_key_is_rejected() {
        let err = SessionOptions::from_json(r#"{"certificate_file": "server.pem"}"#)
            .expect_err("lone certificate must be rejected");
        assert!(matches!(err, TlsError::Configuration(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SessionOptions::from_json(r#"{"cert": "x"}"#).is_err());
    }

    #[test]
    fn inverted_version_range_is_rejected() {
        let options =
            SessionOptions::new().with_versions(ProtocolVersion::Tls13, ProtocolVersion::Tls12);
        assert!(options.validate().is_err());
    }
}
