use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// Accepts `png`, `jpg`, `jpeg` and their `image/` MIME forms.
    pub fn from_name(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        let name = lowered.strip_prefix("image/").unwrap_or(&lowered);
        match name {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Body of a submission call. Unset fields are left out of the JSON entirely
/// so the service applies its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_upsampling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Payload safe for event logs: the inline image data is replaced by its
    /// length.
    pub fn manifest(&self) -> Map<String, Value> {
        let mut manifest = match self.to_payload() {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(image) = self.input_image.as_deref() {
            let summary = if image.starts_with("https://") {
                Value::String(image.to_string())
            } else {
                Value::String(format!("<inline {} chars>", image.len()))
            };
            manifest.insert("input_image".to_string(), summary);
        }
        manifest
    }
}
