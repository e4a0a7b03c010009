use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One uploaded image and its detection outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Primary key, also the suffix of the blob object key
    pub id: Uuid,
    /// Verified identity of the uploader
    pub owner_identity: String,
    /// Creation time in epoch milliseconds
    pub created_at: i64,
    /// Detected label, empty while pending
    pub label: String,
    /// Inference duration in milliseconds
    pub inference_time_ms: f64,
    /// Detection time in epoch milliseconds, 0 while pending
    pub detected_at: i64,
    /// Detection confidence in [0, 1]
    pub confidence: f64,
    /// Set once the first result is applied, never cleared
    pub is_detected: bool,
    /// Hex-encoded perceptual hash of the image
    pub perceptual_hash: String,
}

impl Record {
    /// A freshly uploaded record with no detection fields
    pub fn pending(id: Uuid, owner_identity: String, created_at: i64, perceptual_hash: String) -> Self {
        Self {
            id,
            owner_identity,
            created_at,
            label: String::new(),
            inference_time_ms: 0.0,
            detected_at: 0,
            confidence: 0.0,
            is_detected: false,
            perceptual_hash,
        }
    }

    /// Overwrite the detection fields, leaving identity and creation data untouched.
    /// Labels are stored trimmed so they compare equal to filter labels.
    pub fn apply(&mut self, result: &DetectionResult) {
        self.label = result.label.trim().to_string();
        self.inference_time_ms = result.inference_time_ms;
        self.detected_at = result.detected_at;
        self.confidence = result.confidence;
        self.is_detected = true;
    }
}

/// Outcome reported by the inference process for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub label: String,
    pub inference_time_ms: f64,
    pub detected_at: i64,
    /// Floating point in (0, 1]. Integer payloads deserialize into this field unchanged.
    pub confidence: f64,
}

impl DetectionResult {
    /// Check the result before any store access
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.label.trim().is_empty() {
            return Err(CatalogError::validation("label should be filled"));
        }
        if !self.inference_time_ms.is_finite() || self.inference_time_ms <= 0.0 {
            return Err(CatalogError::validation(
                "inferenceTime must be a positive number",
            ));
        }
        if self.detected_at <= 0 {
            return Err(CatalogError::validation("detectedAt should be filled"));
        }
        if !(self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(CatalogError::validation(format!(
                "confidence must be within (0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// A record as returned to clients, with a freshly signed download link
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    #[serde(flatten)]
    pub record: Record,
    /// Signed download URL, never persisted
    pub file_url: String,
    /// Expiry of `file_url` in epoch milliseconds
    pub file_url_expires_at: i64,
}

/// Persisted shape of a record.
///
/// This is the only place where stored documents are decoded. Every detection
/// field is optional so that documents written by older producers still load;
/// absent fields fall back to their pending defaults in [`RecordDocument::into_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RecordDocument {
    pub id: Uuid,
    pub owner_identity: String,
    pub created_at: i64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
    #[serde(default)]
    pub detected_at: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_detected: Option<bool>,
    #[serde(default)]
    pub perceptual_hash: Option<String>,
}

impl RecordDocument {
    pub fn into_record(self) -> Record {
        let label = self.label.unwrap_or_default();
        let detected_at = self.detected_at.unwrap_or(0);
        // A detected flag without a label or timestamp is not a valid detected state.
        let is_detected = self.is_detected.unwrap_or(false) && !label.is_empty() && detected_at > 0;

        Record {
            id: self.id,
            owner_identity: self.owner_identity,
            created_at: self.created_at,
            label,
            inference_time_ms: self.inference_time_ms.unwrap_or(0.0),
            detected_at,
            confidence: self.confidence.unwrap_or(0.0),
            is_detected,
            perceptual_hash: self.perceptual_hash.unwrap_or_default(),
        }
    }
}

impl From<&Record> for RecordDocument {
    fn from(r: &Record) -> Self {
        Self {
            id: r.id,
            owner_identity: r.owner_identity.clone(),
            created_at: r.created_at,
            label: Some(r.label.clone()),
            inference_time_ms: Some(r.inference_time_ms),
            detected_at: Some(r.detected_at),
            confidence: Some(r.confidence),
            is_detected: Some(r.is_detected),
            perceptual_hash: Some(r.perceptual_hash.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> DetectionResult {
        DetectionResult {
            label: "cat".to_string(),
            inference_time_ms: 120.0,
            detected_at: 1_700_000_000_000,
            confidence: 0.92,
        }
    }

    #[test]
    fn test_apply_keeps_identity_fields() {
        let id = Uuid::new_v4();
        let mut record = Record::pending(id, "a@x.com".to_string(), 42, "ff00".to_string());
        record.apply(&result());

        assert!(record.is_detected);
        assert_eq!(record.label, "cat");
        assert_eq!(record.id, id);
        assert_eq!(record.owner_identity, "a@x.com");
        assert_eq!(record.created_at, 42);
        assert_eq!(record.perceptual_hash, "ff00");
    }

    #[test]
    fn test_apply_trims_label() {
        let mut record = Record::pending(Uuid::new_v4(), "a@x.com".to_string(), 1, String::new());
        let mut padded = result();
        padded.label = "  cat ".to_string();
        record.apply(&padded);
        assert_eq!(record.label, "cat");
    }

    #[test]
    fn test_validate_result() {
        assert!(result().validate().is_ok());

        let mut r = result();
        r.label = "  ".to_string();
        assert!(matches!(r.validate(), Err(CatalogError::Validation(_))));

        let mut r = result();
        r.confidence = 1.5;
        assert!(matches!(r.validate(), Err(CatalogError::Validation(_))));

        let mut r = result();
        r.confidence = f64::NAN;
        assert!(r.validate().is_err());

        let mut r = result();
        r.detected_at = 0;
        assert!(r.validate().is_err());

        let mut r = result();
        r.inference_time_ms = -1.0;
        assert!(r.validate().is_err());

        let mut r = result();
        r.inference_time_ms = 0.0;
        assert!(r.validate().is_err());

        let mut r = result();
        r.confidence = 0.0;
        assert!(r.validate().is_err());

        let mut r = result();
        r.confidence = 1.0;
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_document_defaults_for_absent_fields() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "ownerIdentity": "a@x.com",
            "createdAt": 1700000000000
        }"#;

        let record = serde_json::from_str::<RecordDocument>(json).unwrap().into_record();
        assert_eq!(record.label, "");
        assert_eq!(record.detected_at, 0);
        assert_eq!(record.confidence, 0.0);
        assert!(!record.is_detected);
        assert_eq!(record.perceptual_hash, "");
    }

    #[test]
    fn test_document_accepts_integer_confidence() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "ownerIdentity": "a@x.com",
            "createdAt": 1,
            "label": "dog",
            "detectedAt": 5,
            "confidence": 1,
            "isDetected": true
        }"#;

        let record = serde_json::from_str::<RecordDocument>(json).unwrap().into_record();
        assert_eq!(record.confidence, 1.0);
        assert!(record.is_detected);
    }

    #[test]
    fn test_document_rejects_inconsistent_detected_flag() {
        let doc = RecordDocument {
            id: Uuid::new_v4(),
            owner_identity: "a@x.com".to_string(),
            created_at: 1,
            label: None,
            inference_time_ms: None,
            detected_at: None,
            confidence: None,
            is_detected: Some(true),
            perceptual_hash: None,
        };
        assert!(!doc.into_record().is_detected);
    }

    #[test]
    fn test_document_round_trip_preserves_record() {
        let mut record = Record::pending(Uuid::new_v4(), "a@x.com".to_string(), 7, "ab".to_string());
        record.apply(&result());
        let doc = RecordDocument::from(&record);
        assert_eq!(doc.into_record(), record);
    }

    #[test]
    fn test_view_serializes_flat_camel_case() {
        let record = Record::pending(Uuid::new_v4(), "a@x.com".to_string(), 7, "ab".to_string());
        let view = RecordView {
            record,
            file_url: "https://example.test/images/x".to_string(),
            file_url_expires_at: 100,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["ownerIdentity"], "a@x.com");
        assert_eq!(value["isDetected"], false);
        assert_eq!(value["fileUrl"], "https://example.test/images/x");
    }
}
