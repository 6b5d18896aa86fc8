use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GenerateError;

/// Default service endpoint; overridable per `ServiceConfig`.
pub const DEFAULT_BASE_URL: &str = "https://api.o1key.com";

/// Upper bound on reference images accepted by either wire protocol.
pub const MAX_REFERENCE_IMAGES: usize = 9;

/// Fixed set of output aspect ratios the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    Square,
    Portrait2x3,
    Landscape3x2,
    Portrait3x4,
    Landscape4x3,
    Portrait4x5,
    Landscape5x4,
    Portrait9x16,
    Landscape16x9,
    Ultrawide21x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 10] = [
        AspectRatio::Square,
        AspectRatio::Portrait2x3,
        AspectRatio::Landscape3x2,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait4x5,
        AspectRatio::Landscape5x4,
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
        AspectRatio::Ultrawide21x9,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait2x3 => "2:3",
            AspectRatio::Landscape3x2 => "3:2",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Landscape5x4 => "5:4",
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Ultrawide21x9 => "21:9",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = GenerateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AspectRatio::ALL
            .iter()
            .copied()
            .find(|ratio| ratio.as_str() == value.trim())
            .ok_or_else(|| GenerateError::InvalidRequest {
                message: format!("unknown aspect ratio {value:?}; expected one of 1:1, 2:3, 3:2, 3:4, 4:3, 4:5, 5:4, 9:16, 16:9, 21:9"),
            })
    }
}

/// Output quality tier, distinct from aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    OneK,
    TwoK,
    FourK,
}

impl ResolutionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionTier::OneK => "1K",
            ResolutionTier::TwoK => "2K",
            ResolutionTier::FourK => "4K",
        }
    }

    /// Model-name suffix the service uses to request higher tiers.
    pub fn model_suffix(self) -> &'static str {
        match self {
            ResolutionTier::OneK => "",
            ResolutionTier::TwoK => "-2k",
            ResolutionTier::FourK => "-4k",
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionTier {
    type Err = GenerateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(ResolutionTier::OneK),
            "2K" => Ok(ResolutionTier::TwoK),
            "4K" => Ok(ResolutionTier::FourK),
            _ => Err(GenerateError::InvalidRequest {
                message: format!("unknown resolution tier {value:?}; expected 1K, 2K, or 4K"),
            }),
        }
    }
}

/// Advisory response-encoding preference; the server may override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    Base64,
    Url,
}

impl ResponseFormat {
    pub fn wire_value(self) -> &'static str {
        match self {
            ResponseFormat::Base64 => "b64_json",
            ResponseFormat::Url => "url",
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = GenerateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "b64_json" | "base64" | "b64" => Ok(ResponseFormat::Base64),
            "url" => Ok(ResponseFormat::Url),
            _ => Err(GenerateError::InvalidRequest {
                message: format!("unknown response format {value:?}; expected b64_json or url"),
            }),
        }
    }
}

/// One logical generation: prompt plus everything needed to build a wire call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: AspectRatio,
    pub resolution: ResolutionTier,
    /// Raw encoded bytes of conditioning images, in caller order.
    pub reference_images: Vec<Vec<u8>>,
    /// Carried for bookkeeping only; neither protocol transmits it.
    pub seed: Option<i64>,
    pub response_format: ResponseFormat,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            aspect_ratio: AspectRatio::Square,
            resolution: ResolutionTier::TwoK,
            reference_images: Vec::new(),
            seed: None,
            response_format: ResponseFormat::Base64,
        }
    }

    pub fn validate(&self) -> Result<(), GenerateError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerateError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }
        if self.reference_images.len() > MAX_REFERENCE_IMAGES {
            return Err(GenerateError::InvalidRequest {
                message: format!(
                    "too many reference images: {} supplied, at most {MAX_REFERENCE_IMAGES} accepted",
                    self.reference_images.len()
                ),
            });
        }
        Ok(())
    }
}

/// Connection parameters shared by every request issued through one client.
///
/// Immutable once built; there is deliberately no process-wide default state.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_key: String,
    pub base_url: String,
    pub proxy: Option<String>,
    /// Origins (`scheme://host[:port]`) for which certificate validation is
    /// relaxed. Everything else is verified normally.
    pub insecure_origins: Vec<String>,
}

impl ServiceConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy: None,
            insecure_origins: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_insecure_origin(mut self, origin: impl Into<String>) -> Self {
        self.insecure_origins.push(origin.into());
        self
    }

    pub fn allows_insecure(&self, origin: &str) -> bool {
        self.insecure_origins
            .iter()
            .any(|trusted| trusted.trim_end_matches('/') == origin.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratios_round_trip_through_strings() {
        for ratio in AspectRatio::ALL {
            let parsed: AspectRatio = ratio.as_str().parse().unwrap();
            assert_eq!(parsed, ratio);
        }
        assert!("7:5".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn resolution_tier_parsing_is_case_insensitive() {
        assert_eq!("2k".parse::<ResolutionTier>().unwrap(), ResolutionTier::TwoK);
        assert_eq!("4K".parse::<ResolutionTier>().unwrap(), ResolutionTier::FourK);
        assert!("8K".parse::<ResolutionTier>().is_err());
    }

    #[test]
    fn tier_suffixes_match_service_convention() {
        assert_eq!(ResolutionTier::OneK.model_suffix(), "");
        assert_eq!(ResolutionTier::TwoK.model_suffix(), "-2k");
        assert_eq!(ResolutionTier::FourK.model_suffix(), "-4k");
    }

    #[test]
    fn validate_rejects_blank_prompt() {
        let request = GenerationRequest::new("   ", "gpt-image-1");
        assert!(matches!(
            request.validate(),
            Err(GenerateError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn validate_bounds_reference_images() {
        let mut request = GenerationRequest::new("a red circle", "gpt-image-1");
        request.reference_images = vec![vec![0u8; 4]; MAX_REFERENCE_IMAGES];
        assert!(request.validate().is_ok());
        request.reference_images.push(vec![0u8; 4]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn insecure_origin_matching_ignores_trailing_slash() {
        let config = ServiceConfig::new("k").with_insecure_origin("https://fast.example:8443/");
        assert!(config.allows_insecure("https://fast.example:8443"));
        assert!(!config.allows_insecure("https://other.example"));
    }
}
