use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Decoded form of a `data:<mime>;base64,<payload>` image string.
///
/// All image payloads cross the contracts boundary in this encoding; the
/// bytes themselves are passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DataUri {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let rest = raw
            .trim()
            .strip_prefix("data:")
            .context("image is not a data URI (missing 'data:' prefix)")?;
        let (header, payload) = rest
            .split_once(',')
            .context("data URI has no payload separator")?;
        let Some(mime_type) = header.strip_suffix(";base64") else {
            bail!("data URI is not base64-encoded");
        };
        if mime_type.is_empty() {
            bail!("data URI has an empty mime type");
        }
        let bytes = BASE64
            .decode(payload.as_bytes())
            .context("data URI base64 decode failed")?;
        Ok(Self {
            mime_type: mime_type.to_string(),
            bytes,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            BASE64.encode(&self.bytes)
        )
    }
}

/// One outfit-curation request: an occasion plus the image payloads to
/// choose from, all as data URIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationRequest {
    pub occasion: String,
    #[serde(default)]
    pub clothing_items: Vec<String>,
    pub person_image: Option<String>,
}

/// What a curation hands back: the stylist's suggestion and, when image
/// generation succeeded, the rendered outfit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationResult {
    pub suggestion: String,
    pub image_uri: Option<String>,
    pub image_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{CurationRequest, DataUri};

    #[test]
    fn data_uri_roundtrip() -> anyhow::Result<()> {
        let original = DataUri::new("image/png", vec![0x89, b'P', b'N', b'G']);
        let encoded = original.encode();
        assert!(encoded.starts_with("data:image/png;base64,"));
        let parsed = DataUri::parse(&encoded)?;
        assert_eq!(parsed, original);
        Ok(())
    }

    #[test]
    fn data_uri_rejects_malformed_input() {
        assert!(DataUri::parse("http://example.com/a.png").is_err());
        assert!(DataUri::parse("data:image/png,plain").is_err());
        assert!(DataUri::parse("data:;base64,AAAA").is_err());
        assert!(DataUri::parse("data:image/png;base64,not-base64!").is_err());
    }

    #[test]
    fn curation_request_defaults_deserialize() -> anyhow::Result<()> {
        let request: CurationRequest =
            serde_json::from_str(r#"{"occasion": "brunch"}"#)?;
        assert_eq!(request.occasion, "brunch");
        assert!(request.clothing_items.is_empty());
        assert!(request.person_image.is_none());
        Ok(())
    }
}
