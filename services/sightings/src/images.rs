use crate::config::{ConfigError, ImageConfig};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Header carrying the notification timestamp
pub const TIMESTAMP_HEADER: &str = "X-Cld-Timestamp";
/// Header carrying the notification signature
pub const SIGNATURE_HEADER: &str = "X-Cld-Signature";

const DELIVERY_HOST: &str = "res.cloudinary.com";
const UPLOAD_PRESET_PARAM: &str = "upload_preset";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Notification signature does not match expected")]
    Mismatch,

    #[error("Notification is missing the {0} header")]
    MissingHeader(&'static str),
}

/// Reference to a stored image asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub public_id: String,
    pub format: String,
}

impl ImageRef {
    pub fn new(public_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            public_id: public_id.into(),
            format: format.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.public_id.is_empty() || self.format.is_empty()
    }

    /// Asset path under an optional transform, e.g. `c_limit,w_300/abc.jpg`
    pub fn path(&self, transform: &str) -> String {
        let file = format!("{}.{}", self.public_id, self.format);
        let transform = transform.trim_matches('/');
        if transform.is_empty() {
            file
        } else {
            format!("{}/{}", transform, file)
        }
    }
}

/// Signs upload parameters and delivery URLs, and authenticates
/// notifications from the image pipeline, using its shared secret.
pub struct ImageSigner {
    secret: SecretString,
    cloud_name: String,
    upload_preset: String,
    thumbnail_transform: String,
}

impl ImageSigner {
    pub fn new(config: &ImageConfig) -> Result<Self, ConfigError> {
        Self::from_parts(
            SecretString::from(config.api_secret.expose_secret().to_owned()),
            &config.cloud_name,
            &config.upload_preset,
            &config.thumbnail_transform,
        )
    }

    pub fn from_parts(
        secret: SecretString,
        cloud_name: &str,
        upload_preset: &str,
        thumbnail_transform: &str,
    ) -> Result<Self, ConfigError> {
        if secret.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequired("images.api_secret".to_string()));
        }
        if cloud_name.is_empty() {
            return Err(ConfigError::MissingRequired("images.cloud_name".to_string()));
        }
        Ok(Self {
            secret,
            cloud_name: cloud_name.to_string(),
            upload_preset: upload_preset.to_string(),
            thumbnail_transform: thumbnail_transform.to_string(),
        })
    }

    pub fn thumbnail_transform(&self) -> &str {
        &self.thumbnail_transform
    }

    fn digest(&self, payload: &str) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(payload.as_bytes());
        hasher.update(self.secret.expose_secret().as_bytes());
        hasher.finalize().to_vec()
    }

    /// Signature over `key=value` pairs sorted by key and joined with `&`
    pub fn upload_signature(&self, parameters: &BTreeMap<String, String>) -> String {
        hex::encode(self.digest(&encode_parameters(parameters)))
    }

    /// Sign upload parameters for a client.
    ///
    /// A client-supplied `upload_preset` is replaced by the configured one, so
    /// an upload attempted under any other preset fails verification upstream.
    pub fn sign_upload(&self, mut parameters: BTreeMap<String, String>) -> String {
        if let Some(preset) = parameters.get_mut(UPLOAD_PRESET_PARAM) {
            *preset = self.upload_preset.clone();
        }
        self.upload_signature(&parameters)
    }

    /// `s--XXXXXXXX--` path segment authorizing one asset under one transform
    pub fn delivery_signature(&self, image: &ImageRef, transform: &str) -> String {
        let encoded = URL_SAFE.encode(self.digest(&image.path(transform)));
        format!("s--{}--", &encoded[..8])
    }

    /// Authenticated delivery URL, or `None` for an empty reference
    pub fn delivery_url(&self, image: &ImageRef, transform: &str) -> Option<String> {
        if image.is_empty() {
            return None;
        }
        Some(format!(
            "https://{host}/{cloud}/image/authenticated/{signature}/{path}",
            host = DELIVERY_HOST,
            cloud = self.cloud_name,
            signature = self.delivery_signature(image, transform),
            path = image.path(transform),
        ))
    }

    /// Expected signature of a notification body sent at `timestamp`
    pub fn notification_signature(&self, body: &str, timestamp: &str) -> String {
        hex::encode(self.digest(&format!("{}{}", body, timestamp)))
    }

    /// Check a claimed notification signature in constant time
    pub fn verify_notification(
        &self,
        body: &str,
        timestamp: &str,
        claimed: &str,
    ) -> Result<(), SignatureError> {
        let expected = self.notification_signature(body, timestamp);
        if bool::from(expected.as_bytes().ct_eq(claimed.as_bytes())) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

/// Encode parameters as `key1=value1&key2=value2` in ascending key order
fn encode_parameters(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}
