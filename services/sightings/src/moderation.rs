//! Image lifecycle driven by notifications from the image pipeline.
//!
//! An `upload` notification records the image as pending. A later
//! `moderation` notification moves it to the reported status. Only approved
//! images are ever joined onto car listings. Every notification is
//! authenticated against the shared secret before its body is parsed.

use crate::images::{ImageSigner, SignatureError, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::store::{ImageUpdate, ModerationStatus, NewImage, SightingStore, StoreError};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const UPLOAD: &str = "upload";
const MODERATION: &str = "moderation";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Notification rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("Malformed notification body: {0}")]
    Malformed(String),

    #[error("Notification is missing required field {0}")]
    MissingField(&'static str),

    #[error("No upload recorded for image {0}")]
    UnknownImage(String),

    #[error("Failed to record notification: {0}")]
    Store(#[from] StoreError),
}

/// Notification body sent by the image pipeline
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Notification {
    /// Absent on some pipeline events; those are ignored
    #[serde(default)]
    pub notification_type: String,
    pub public_id: Option<String>,
    pub format: Option<String>,
    pub moderation_status: Option<String>,
    /// Asset version the notification refers to
    pub version: Option<i64>,
}

/// How a notification was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// A new image was recorded as pending
    Recorded,
    /// The upload had already been recorded
    AlreadyRecorded,
    /// The image's moderation status was updated
    Updated,
    /// The notification referred to a different version and was dropped
    Stale,
    /// The notification type is not one we act on
    Ignored,
}

pub struct ModerationLedger {
    store: Arc<dyn SightingStore>,
    signer: Arc<ImageSigner>,
}

impl ModerationLedger {
    pub fn new(store: Arc<dyn SightingStore>, signer: Arc<ImageSigner>) -> Self {
        Self { store, signer }
    }

    /// Authenticate a raw notification, then parse and apply it.
    ///
    /// Nothing is parsed or written unless the signature matches.
    #[instrument(skip_all)]
    pub async fn handle_webhook(
        &self,
        body: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<NotificationOutcome, LedgerError> {
        if let Err(e) = self.authenticate(body, timestamp, signature) {
            warn!(error = %e, "Rejected image notification");
            metrics::counter!("sightings.notifications.rejected").increment(1);
            return Err(e.into());
        }

        let notification: Notification =
            serde_json::from_str(body).map_err(|e| LedgerError::Malformed(e.to_string()))?;

        self.apply_notification(notification).await
    }

    fn authenticate(
        &self,
        body: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
        self.signer.verify_notification(body, timestamp, signature)
    }

    /// Apply an already authenticated notification
    #[instrument(skip(self, notification), fields(
        notification_type = %notification.notification_type,
        public_id = notification.public_id.as_deref().unwrap_or_default(),
    ))]
    pub async fn apply_notification(
        &self,
        notification: Notification,
    ) -> Result<NotificationOutcome, LedgerError> {
        let notification_type = notification.notification_type.clone();
        let outcome = match notification_type.as_str() {
            UPLOAD => self.record_upload(notification).await?,
            MODERATION => self.record_moderation(notification).await?,
            other => {
                debug!(notification_type = other, "Ignoring notification");
                NotificationOutcome::Ignored
            }
        };

        metrics::counter!(
            "sightings.notifications.applied",
            "type" => notification_type_label(&outcome)
        )
        .increment(1);

        Ok(outcome)
    }

    async fn record_upload(
        &self,
        notification: Notification,
    ) -> Result<NotificationOutcome, LedgerError> {
        let image = NewImage {
            public_id: required(notification.public_id, "public_id")?,
            format: required(notification.format, "format")?,
            version: notification.version,
        };

        if self.store.insert_image(&image).await? {
            info!("Image upload recorded");
            Ok(NotificationOutcome::Recorded)
        } else {
            debug!("Image upload already recorded");
            Ok(NotificationOutcome::AlreadyRecorded)
        }
    }

    async fn record_moderation(
        &self,
        notification: Notification,
    ) -> Result<NotificationOutcome, LedgerError> {
        let public_id = required(notification.public_id, "public_id")?;
        let status = ModerationStatus::from(required(
            notification.moderation_status,
            "moderation_status",
        )?);

        match self
            .store
            .update_image_status(&public_id, &status, notification.version)
            .await?
        {
            ImageUpdate::Applied => {
                info!(status = status.as_str(), "Image moderation recorded");
                Ok(NotificationOutcome::Updated)
            }
            ImageUpdate::VersionMismatch { stored } => {
                warn!(
                    claimed = ?notification.version,
                    ?stored,
                    "Ignoring moderation for a different image version"
                );
                Ok(NotificationOutcome::Stale)
            }
            ImageUpdate::NotFound => Err(LedgerError::UnknownImage(public_id)),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, LedgerError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(LedgerError::MissingField(field))
}

fn notification_type_label(outcome: &NotificationOutcome) -> &'static str {
    match outcome {
        NotificationOutcome::Recorded | NotificationOutcome::AlreadyRecorded => UPLOAD,
        NotificationOutcome::Updated | NotificationOutcome::Stale => MODERATION,
        NotificationOutcome::Ignored => "ignored",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use secrecy::SecretString;
    use serde_json::json;

    fn ledger() -> (Arc<MemoryStore>, Arc<ImageSigner>, ModerationLedger) {
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(
            ImageSigner::from_parts(
                SecretString::from("abcd".to_string()),
                "dawfgqsur",
                "manualsmap_com",
                "c_limit,w_300",
            )
            .unwrap(),
        );
        let ledger = ModerationLedger::new(store.clone(), signer.clone());
        (store, signer, ledger)
    }

    fn upload(public_id: &str, version: Option<i64>) -> Notification {
        Notification {
            notification_type: "upload".to_string(),
            public_id: Some(public_id.to_string()),
            format: Some("jpg".to_string()),
            moderation_status: None,
            version,
        }
    }

    fn moderation(public_id: &str, status: &str, version: Option<i64>) -> Notification {
        Notification {
            notification_type: "moderation".to_string(),
            public_id: Some(public_id.to_string()),
            format: None,
            moderation_status: Some(status.to_string()),
            version,
        }
    }

    #[tokio::test]
    async fn test_upload_then_moderation() {
        let (store, _, ledger) = ledger();

        let outcome = ledger.apply_notification(upload("img1", None)).await.unwrap();
        assert_eq!(outcome, NotificationOutcome::Recorded);
        assert_eq!(store.image_status("img1"), Some(ModerationStatus::Pending));

        let outcome = ledger.apply_notification(upload("img1", None)).await.unwrap();
        assert_eq!(outcome, NotificationOutcome::AlreadyRecorded);

        let outcome = ledger
            .apply_notification(moderation("img1", "approved", None))
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Updated);
        assert_eq!(store.image_status("img1"), Some(ModerationStatus::Approved));
    }

    #[tokio::test]
    async fn test_moderation_before_upload_is_rejected() {
        let (store, _, ledger) = ledger();
        let err = ledger
            .apply_notification(moderation("ghost", "approved", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownImage(id) if id == "ghost"));
        assert_eq!(store.image_status("ghost"), None);
    }

    #[tokio::test]
    async fn test_stale_version_is_ignored() {
        let (store, _, ledger) = ledger();
        ledger
            .apply_notification(upload("img2", Some(10)))
            .await
            .unwrap();

        let outcome = ledger
            .apply_notification(moderation("img2", "approved", Some(9)))
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Stale);
        assert_eq!(store.image_status("img2"), Some(ModerationStatus::Pending));

        let outcome = ledger
            .apply_notification(moderation("img2", "rejected", Some(10)))
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Updated);
        assert_eq!(store.image_status("img2"), Some(ModerationStatus::Rejected));
    }

    #[tokio::test]
    async fn test_moderation_applies_to_unversioned_upload() {
        let (store, _, ledger) = ledger();
        ledger.apply_notification(upload("img5", None)).await.unwrap();

        let outcome = ledger
            .apply_notification(moderation("img5", "approved", Some(5)))
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Updated);
        assert_eq!(store.image_status("img5"), Some(ModerationStatus::Approved));
    }

    #[tokio::test]
    async fn test_untyped_signed_notification_is_ignored() {
        let (store, _, ledger) = ledger();
        let body = r#"{"public_id":"djhoeaqcynvogt9xzbn9","version":1368881626,"width":864,"height":576,"format":"jpg","resource_type":"image","created_at":"2013-05-18T12:53:46Z","bytes":120253,"type":"upload","url":"https://res.cloudinary.com/1233456ab/image/upload/v1368881626/djhoeaqcynvogt9xzbn9.jpg","secure_url":"https://cloudinary-a.akamaihd.net/1233456ab/image/upload/v1368881626/djhoeaqcynvogt9xzbn9.jpg"}"#;

        let outcome = ledger
            .handle_webhook(
                body,
                Some("1368881627"),
                Some("0f2cb563a8edbdd6bc865a8c3d14fe9bdbebc1a3"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Ignored);
        assert_eq!(store.image_status("djhoeaqcynvogt9xzbn9"), None);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (_, _, ledger) = ledger();
        let notification = Notification {
            notification_type: "eager".to_string(),
            public_id: None,
            format: None,
            moderation_status: None,
            version: None,
        };
        let outcome = ledger.apply_notification(notification).await.unwrap();
        assert_eq!(outcome, NotificationOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_upload_without_format_is_malformed() {
        let (_, _, ledger) = ledger();
        let mut notification = upload("img3", None);
        notification.format = Some(" ".to_string());
        let err = ledger.apply_notification(notification).await.unwrap_err();
        assert!(matches!(err, LedgerError::MissingField("format")));
    }

    #[tokio::test]
    async fn test_webhook_requires_valid_signature() {
        let (store, signer, ledger) = ledger();
        let body = json!({
            "notification_type": "upload",
            "public_id": "img4",
            "format": "png",
            "version": 1
        })
        .to_string();
        let timestamp = "1315060076";

        let err = ledger
            .handle_webhook(&body, Some(timestamp), Some("0000"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Signature(SignatureError::Mismatch)));
        assert_eq!(store.image_status("img4"), None);

        let err = ledger
            .handle_webhook(&body, None, Some("0000"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Signature(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        ));

        let signature = signer.notification_signature(&body, timestamp);
        let outcome = ledger
            .handle_webhook(&body, Some(timestamp), Some(&signature))
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Recorded);
        assert_eq!(store.image_status("img4"), Some(ModerationStatus::Pending));
    }

    #[tokio::test]
    async fn test_signed_garbage_is_malformed() {
        let (_, signer, ledger) = ledger();
        let body = "not json";
        let signature = signer.notification_signature(body, "1");
        let err = ledger
            .handle_webhook(body, Some("1"), Some(&signature))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Malformed(_)));
    }
}
