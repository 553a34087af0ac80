use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView, GrayImage};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::color_ops::{
    centered_ellipse_mask, coerce_mask, hsv_in_range_mask, mask_coverage, SEGMENTATION_HIGHLIGHT,
};
use crate::pipeline::gradio::{GradioClient, GradioError};
use crate::pipeline::image_io::{decode_rgb, encode_png};
use crate::pipeline::EndpointDescriptor;

const SEGMENT_API_NAME: &str = "/inference_image";

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("{0}")]
    Remote(String),
    #[error("segmentation visualization decode failed: {0}")]
    Visualization(String),
    #[error("image encode failed: {0}")]
    Encode(String),
}

impl From<GradioError> for SegmentationError {
    fn from(error: GradioError) -> Self {
        Self::Remote(error.to_string())
    }
}

/// What to do after an endpoint fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Capacity or quota exhaustion: wait the backoff interval before moving on.
    BackoffThenNext,
    /// Anything else: move on immediately.
    NextImmediately,
}

/// Error text containing "quota" or "gpu" (any case) is a capacity failure.
/// The matching rule depends on third-party error wording and lives only here.
pub fn classify(error: &SegmentationError) -> RetryPolicy {
    let text = error.to_string().to_ascii_lowercase();
    if text.contains("quota") || text.contains("gpu") {
        RetryPolicy::BackoffThenNext
    } else {
        RetryPolicy::NextImmediately
    }
}

/// One remote segmentation service. Returns the raw visualization image in
/// which the selected region is painted in the highlight band.
pub trait SegmentationBackend: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn segment(
        &self,
        image_png: &[u8],
        object_prompt: &str,
    ) -> Result<DynamicImage, SegmentationError>;
}

pub type SharedSegmentationBackend = Arc<dyn SegmentationBackend>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttempt {
    pub endpoint: String,
    pub policy: RetryPolicy,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaskOutcome {
    Segmented {
        endpoint: String,
        mask: GrayImage,
        attempts: Vec<EndpointAttempt>,
    },
    Fallback {
        mask: GrayImage,
        attempts: Vec<EndpointAttempt>,
    },
}

impl MaskOutcome {
    pub fn mask(&self) -> &GrayImage {
        match self {
            Self::Segmented { mask, .. } | Self::Fallback { mask, .. } => mask,
        }
    }

    pub fn into_mask(self) -> GrayImage {
        match self {
            Self::Segmented { mask, .. } | Self::Fallback { mask, .. } => mask,
        }
    }

    pub fn attempts(&self) -> &[EndpointAttempt] {
        match self {
            Self::Segmented { attempts, .. } | Self::Fallback { attempts, .. } => attempts,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Ordered endpoint failover ending in a synthetic mask. Never fails.
#[derive(Clone)]
pub struct MaskAcquisition {
    endpoints: Vec<SharedSegmentationBackend>,
    quota_backoff: Duration,
}

impl MaskAcquisition {
    pub fn new(endpoints: Vec<SharedSegmentationBackend>, quota_backoff: Duration) -> Self {
        Self {
            endpoints,
            quota_backoff,
        }
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name().to_string()).collect()
    }

    /// Mask for `object_prompt`, always sized like `image`.
    pub fn acquire_mask(&self, image: &DynamicImage, object_prompt: &str) -> MaskOutcome {
        let (width, height) = image.dimensions();
        let mut attempts = Vec::new();

        let image_png = match encode_png(image) {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                warn!(%error, "could not encode image for segmentation; skipping endpoints");
                None
            }
        };

        if let Some(image_png) = image_png {
            let last = self.endpoints.len().saturating_sub(1);
            for (idx, backend) in self.endpoints.iter().enumerate() {
                let result = backend
                    .segment(image_png.as_slice(), object_prompt)
                    .map(|vis| visualization_to_mask(&vis, width, height));
                let error = match result {
                    Ok(mask) => {
                        info!(
                            endpoint = backend.name(),
                            object = object_prompt,
                            coverage = mask_coverage(&mask),
                            "segmentation mask acquired"
                        );
                        return MaskOutcome::Segmented {
                            endpoint: backend.name().to_string(),
                            mask,
                            attempts,
                        };
                    }
                    Err(error) => error,
                };

                let policy = classify(&error);
                warn!(
                    endpoint = backend.name(),
                    ?policy,
                    %error,
                    "segmentation endpoint failed"
                );
                attempts.push(EndpointAttempt {
                    endpoint: backend.name().to_string(),
                    policy,
                    error: error.to_string(),
                });
                if policy == RetryPolicy::BackoffThenNext
                    && idx < last
                    && !self.quota_backoff.is_zero()
                {
                    std::thread::sleep(self.quota_backoff);
                }
            }
        }

        warn!(
            object = object_prompt,
            width, height, "all segmentation endpoints failed; using fallback mask"
        );
        MaskOutcome::Fallback {
            mask: centered_ellipse_mask(width, height),
            attempts,
        }
    }
}

/// Thresholds the visualization on the highlight band, then coerces the
/// result to `width`x`height`.
pub fn visualization_to_mask(vis: &DynamicImage, width: u32, height: u32) -> GrayImage {
    let raw = hsv_in_range_mask(&vis.to_rgb8(), &SEGMENTATION_HIGHLIGHT);
    coerce_mask(&DynamicImage::ImageLuma8(raw), width, height)
}

/// A segmentation Space reached through the Gradio API.
#[derive(Debug, Clone)]
pub struct GradioSegmentationBackend {
    endpoint: EndpointDescriptor,
    token: Option<String>,
    timeout: Duration,
}

impl GradioSegmentationBackend {
    pub fn new(endpoint: EndpointDescriptor, token: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint,
            token,
            timeout,
        }
    }
}

impl SegmentationBackend for GradioSegmentationBackend {
    fn name(&self) -> &str {
        self.endpoint.name.as_str()
    }

    fn segment(
        &self,
        image_png: &[u8],
        object_prompt: &str,
    ) -> Result<DynamicImage, SegmentationError> {
        let client =
            GradioClient::connect(self.endpoint.uri.as_str(), self.token.clone(), self.timeout)?;
        let image_ref = client.upload_png(image_png.to_vec(), "image.png")?;
        let outputs = client.predict(
            SEGMENT_API_NAME,
            vec![
                image_ref,
                Value::String(object_prompt.to_string()),
                Value::Bool(false),
            ],
        )?;
        let first = outputs
            .first()
            .ok_or_else(|| SegmentationError::Remote(String::from("segmentation returned no output")))?;
        let bytes = client.download_file(first)?;
        decode_rgb(bytes.as_slice()).map_err(|e| SegmentationError::Visualization(e.to_string()))
    }
}
