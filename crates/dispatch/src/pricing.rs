//! Pricing table and job cost calculation
//!
//! Credits are the single currency used to authorize work. The static table
//! below is the authoritative source for per-unit prices; everything else
//! derives from it. Unknown shapes fall back to 1 credit per item.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Credits per unit, by pricing key
pub const PRICING: [(&str, i64); 10] = [
    ("i2i_standard", 1),
    ("i2i_high", 2),
    ("i2i_nsfw", 1),
    ("i2v_5s", 5),
    ("i2v_10s", 10),
    ("pipeline_full", 15),
    ("carousel_5", 3),
    ("carousel_10", 5),
    ("voice_clone", 5),
    ("face_swap", 2),
];

/// Price for a single pricing key
pub fn price_for_key(key: &str) -> Option<i64> {
    PRICING.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Output families a batch job can produce
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Image,
    Video,
    Carousel,
    Pipeline,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Image => write!(f, "image"),
            OutputKind::Video => write!(f, "video"),
            OutputKind::Carousel => write!(f, "carousel"),
            OutputKind::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl std::str::FromStr for OutputKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" | "i2i" => Ok(OutputKind::Image),
            "video" | "i2v" => Ok(OutputKind::Video),
            "carousel" => Ok(OutputKind::Carousel),
            "pipeline" => Ok(OutputKind::Pipeline),
            _ => Err(anyhow::anyhow!("Invalid output type: {}", s)),
        }
    }
}

/// Image quality tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Standard,
    High,
}

fn default_duration() -> u32 {
    5
}

fn default_slides() -> u32 {
    5
}

/// Job configuration, tagged by output family.
///
/// Stored as a JSON blob on the job row; the scheduler only reads the typed
/// fields it understands. Per-item variation lives on the item rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobConfig {
    Image {
        model: String,
        #[serde(default)]
        quality: Quality,
        #[serde(default)]
        aspect_ratio: Option<String>,
        #[serde(default)]
        nsfw: bool,
        /// Source image for image-to-image generation
        #[serde(default)]
        image_url: Option<String>,
    },
    Video {
        model: String,
        #[serde(default)]
        resolution: Option<String>,
        #[serde(default = "default_duration")]
        duration_sec: u32,
        #[serde(default)]
        negative_prompt: Option<String>,
        /// Source image animated into the video
        #[serde(default)]
        image_url: Option<String>,
    },
    Carousel {
        model: String,
        #[serde(default = "default_slides")]
        slides: u32,
        #[serde(default)]
        aspect_ratio: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
    },
    Pipeline {
        image_model: String,
        video_model: String,
        #[serde(default)]
        resolution: Option<String>,
        #[serde(default = "default_duration")]
        duration_sec: u32,
        #[serde(default)]
        image_url: Option<String>,
    },
}

impl JobConfig {
    /// The output family this config belongs to
    pub fn output_kind(&self) -> OutputKind {
        match self {
            JobConfig::Image { .. } => OutputKind::Image,
            JobConfig::Video { .. } => OutputKind::Video,
            JobConfig::Carousel { .. } => OutputKind::Carousel,
            JobConfig::Pipeline { .. } => OutputKind::Pipeline,
        }
    }

    /// Primary model key, used for adapter dispatch and duration statistics.
    ///
    /// Pipelines report their video model; the image stage is bookkept under
    /// its own key by the generator.
    pub fn model(&self) -> &str {
        match self {
            JobConfig::Image { model, .. } => model,
            JobConfig::Video { model, .. } => model,
            JobConfig::Carousel { model, .. } => model,
            JobConfig::Pipeline { video_model, .. } => video_model,
        }
    }

    /// Job-level source image, if the config carries one
    pub fn image_url(&self) -> Option<&str> {
        match self {
            JobConfig::Image { image_url, .. }
            | JobConfig::Video { image_url, .. }
            | JobConfig::Carousel { image_url, .. }
            | JobConfig::Pipeline { image_url, .. } => image_url.as_deref(),
        }
    }

    /// The pricing key this config maps onto
    pub fn price_key(&self) -> &'static str {
        match self {
            JobConfig::Image { nsfw: true, .. } => "i2i_nsfw",
            JobConfig::Image {
                quality: Quality::High,
                ..
            } => "i2i_high",
            JobConfig::Image { .. } => "i2i_standard",
            JobConfig::Video { duration_sec, .. } => {
                if *duration_sec >= 10 {
                    "i2v_10s"
                } else {
                    "i2v_5s"
                }
            }
            JobConfig::Carousel { slides, .. } => {
                if *slides > 5 {
                    "carousel_10"
                } else {
                    "carousel_5"
                }
            }
            JobConfig::Pipeline { .. } => "pipeline_full",
        }
    }
}

/// Total credit cost for a batch job
pub fn job_cost(config: &JobConfig, quantity: u32) -> i64 {
    let base = price_for_key(config.price_key()).unwrap_or(1);
    base * quantity as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn video(model: &str, duration_sec: u32) -> JobConfig {
        JobConfig::Video {
            model: model.to_string(),
            resolution: None,
            duration_sec,
            negative_prompt: None,
            image_url: None,
        }
    }

    #[test]
    fn test_pricing_table_complete() {
        assert_eq!(price_for_key("i2i_standard"), Some(1));
        assert_eq!(price_for_key("i2i_high"), Some(2));
        assert_eq!(price_for_key("i2i_nsfw"), Some(1));
        assert_eq!(price_for_key("i2v_5s"), Some(5));
        assert_eq!(price_for_key("i2v_10s"), Some(10));
        assert_eq!(price_for_key("pipeline_full"), Some(15));
        assert_eq!(price_for_key("carousel_5"), Some(3));
        assert_eq!(price_for_key("carousel_10"), Some(5));
        assert_eq!(price_for_key("voice_clone"), Some(5));
        assert_eq!(price_for_key("face_swap"), Some(2));
        assert_eq!(price_for_key("nonexistent"), None);
    }

    #[test]
    fn test_image_cost_by_quality_and_nsfw() {
        let standard = JobConfig::Image {
            model: "kling-image".into(),
            quality: Quality::Standard,
            aspect_ratio: None,
            nsfw: false,
            image_url: None,
        };
        let high = JobConfig::Image {
            model: "kling-image".into(),
            quality: Quality::High,
            aspect_ratio: None,
            nsfw: false,
            image_url: None,
        };
        let nsfw = JobConfig::Image {
            model: "kling-image".into(),
            quality: Quality::High,
            aspect_ratio: None,
            nsfw: true,
            image_url: None,
        };

        assert_eq!(job_cost(&standard, 1), 1);
        assert_eq!(job_cost(&high, 1), 2);
        // NSFW runs self-hosted and wins over the quality tier
        assert_eq!(job_cost(&nsfw, 1), 1);
    }

    #[test]
    fn test_video_cost_by_duration() {
        assert_eq!(job_cost(&video("kling", 5), 1), 5);
        assert_eq!(job_cost(&video("kling", 10), 1), 10);
        assert_eq!(job_cost(&video("kling", 12), 1), 10);
        assert_eq!(job_cost(&video("kling", 4), 1), 5);
    }

    #[test]
    fn test_carousel_cost_by_slides() {
        let small = JobConfig::Carousel {
            model: "kling-image".into(),
            slides: 5,
            aspect_ratio: None,
            image_url: None,
        };
        let big = JobConfig::Carousel {
            model: "kling-image".into(),
            slides: 10,
            aspect_ratio: None,
            image_url: None,
        };
        assert_eq!(job_cost(&small, 1), 3);
        assert_eq!(job_cost(&big, 1), 5);
    }

    #[test]
    fn test_pipeline_cost() {
        let pipeline = JobConfig::Pipeline {
            image_model: "kling-image".into(),
            video_model: "kling".into(),
            resolution: None,
            duration_sec: 5,
            image_url: None,
        };
        assert_eq!(job_cost(&pipeline, 1), 15);
        assert_eq!(job_cost(&pipeline, 3), 45);
    }

    #[test]
    fn test_cost_scales_with_quantity() {
        assert_eq!(job_cost(&video("kling", 5), 10), 50);
    }

    #[test]
    fn test_output_kind_parse_aliases() {
        assert_eq!(OutputKind::from_str("i2v").unwrap(), OutputKind::Video);
        assert_eq!(OutputKind::from_str("i2i").unwrap(), OutputKind::Image);
        assert_eq!(OutputKind::from_str("IMAGE").unwrap(), OutputKind::Image);
        assert!(OutputKind::from_str("audio").is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let json = r#"{"type": "video", "model": "kling", "resolution": "1080p", "duration_sec": 10, "image_url": "https://cdn/img.jpg"}"#;
        let config: JobConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.output_kind(), OutputKind::Video);
        assert_eq!(config.model(), "kling");
        assert_eq!(config.image_url(), Some("https://cdn/img.jpg"));
        assert_eq!(config.price_key(), "i2v_10s");

        let back = serde_json::to_string(&config).unwrap();
        let reparsed: JobConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_config_defaults() {
        let config: JobConfig =
            serde_json::from_str(r#"{"type": "video", "model": "wan"}"#).unwrap();
        match config {
            JobConfig::Video { duration_sec, .. } => assert_eq!(duration_sec, 5),
            _ => panic!("wrong variant"),
        }
    }
}
