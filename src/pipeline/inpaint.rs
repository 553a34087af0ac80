use std::ops::Deref;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, GrayImage};
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::color_ops::{coerce_mask, fit_within};

/// Per-round inpainting strength. Rounds past the end reuse the last value.
pub const STRENGTH_SCHEDULE: [f32; 5] = [0.9, 0.7, 0.5, 0.4, 0.3];

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

pub fn strength_for_round(round: usize) -> f32 {
    STRENGTH_SCHEDULE[round.min(STRENGTH_SCHEDULE.len() - 1)]
}

pub fn strength_sequence(num_rounds: u32) -> Vec<f32> {
    (0..num_rounds as usize).map(strength_for_round).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementConfig {
    pub num_rounds: u32,
    pub refine_each_round: bool,
    pub use_refiner: bool,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            num_rounds: 3,
            refine_each_round: false,
            use_refiner: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum InpaintError {
    #[error("num_rounds must be at least 1")]
    InvalidRounds,
    #[error("failed to load {model}: {message}")]
    Load { model: String, message: String },
    #[error("{model} inference failed: {message}")]
    Inference { model: String, message: String },
}

#[derive(Debug, Clone, Copy)]
pub struct InpaintRequest<'a> {
    pub prompt: &'a str,
    pub image: &'a DynamicImage,
    pub mask: &'a GrayImage,
    pub strength: f32,
}

/// A loaded, heavyweight model session.
pub trait LoadedModel: Send {
    fn label(&self) -> &str;

    /// Frees whatever the session holds. Called exactly once, by [`ModelLease`].
    fn release(&mut self) {}
}

pub trait InpaintModel: LoadedModel {
    fn inpaint(&self, request: &InpaintRequest<'_>) -> Result<DynamicImage, InpaintError>;
}

pub trait RefinerModel: LoadedModel {
    fn refine(&self, prompt: &str, image: &DynamicImage) -> Result<DynamicImage, InpaintError>;
}

/// Loads fresh model sessions. Nothing is cached between loads.
pub trait ModelProvider: Send + Sync + 'static {
    fn load_inpainter(&self) -> Result<Box<dyn InpaintModel>, InpaintError>;
    fn load_refiner(&self) -> Result<Box<dyn RefinerModel>, InpaintError>;
}

pub type SharedModelProvider = Arc<dyn ModelProvider>;

/// Scoped ownership of a model session; releases it on drop, including
/// during unwinding out of a failed round.
pub struct ModelLease<M: LoadedModel + ?Sized> {
    model: Box<M>,
}

impl<M: LoadedModel + ?Sized> ModelLease<M> {
    pub fn new(model: Box<M>) -> Self {
        debug!(model = model.label(), "model acquired");
        Self { model }
    }
}

impl<M: LoadedModel + ?Sized> Deref for ModelLease<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M: LoadedModel + ?Sized> Drop for ModelLease<M> {
    fn drop(&mut self) {
        self.model.release();
        debug!(model = self.model.label(), "model released");
    }
}

#[derive(Clone)]
pub struct InpaintRefinementEngine {
    models: SharedModelProvider,
    max_dimension: u32,
}

impl InpaintRefinementEngine {
    pub fn new(models: SharedModelProvider) -> Self {
        Self {
            models,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Runs the inpaint loop and any refinement passes. The mask is
    /// recoerced whenever a round returns an image of a different size.
    pub fn run(
        &self,
        image: DynamicImage,
        mask: &GrayImage,
        prompt: &str,
        config: &RefinementConfig,
    ) -> Result<DynamicImage, InpaintError> {
        if config.num_rounds == 0 {
            return Err(InpaintError::InvalidRounds);
        }
        let mut current = fit_within(image, self.max_dimension);
        let (width, height) = current.dimensions();
        let working_mask = DynamicImage::ImageLuma8(coerce_mask(
            &DynamicImage::ImageLuma8(mask.clone()),
            width,
            height,
        ));
        let mut mask = working_mask.to_luma8();
        info!(
            width,
            height,
            rounds = config.num_rounds,
            refine_each_round = config.refine_each_round,
            use_refiner = config.use_refiner,
            prompt,
            "starting inpaint rounds"
        );

        let inpainter = ModelLease::new(self.models.load_inpainter()?);
        for round in 0..config.num_rounds as usize {
            let strength = strength_for_round(round);
            debug!(round, strength, "inpaint round");
            let (cur_w, cur_h) = current.dimensions();
            if mask.dimensions() != (cur_w, cur_h) {
                debug!(round, width = cur_w, height = cur_h, "resizing mask to inpaint output");
                mask = coerce_mask(&working_mask, cur_w, cur_h);
            }
            current = inpainter.inpaint(&InpaintRequest {
                prompt,
                image: &current,
                mask: &mask,
                strength,
            })?;
            if config.refine_each_round && config.use_refiner {
                current = self.refine_once(prompt, &current)?;
            }
        }
        drop(inpainter);

        if config.use_refiner && !config.refine_each_round {
            current = self.refine_once(prompt, &current)?;
        }
        Ok(current)
    }

    fn refine_once(&self, prompt: &str, image: &DynamicImage) -> Result<DynamicImage, InpaintError> {
        let refiner = ModelLease::new(self.models.load_refiner()?);
        refiner.refine(prompt, image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::color_ops::MASK_ON;
    use image::imageops::FilterType;
    use image::{Luma, RgbImage};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn push(log: &EventLog, event: impl Into<String>) {
        log.lock().expect("event log mutex poisoned").push(event.into());
    }

    struct FakeInpainter {
        log: EventLog,
        fail_at_strength: Option<f32>,
        output_size: Option<(u32, u32)>,
    }

    impl LoadedModel for FakeInpainter {
        fn label(&self) -> &str {
            "fake-inpaint"
        }

        fn release(&mut self) {
            push(&self.log, "release inpaint");
        }
    }

    impl InpaintModel for FakeInpainter {
        fn inpaint(&self, request: &InpaintRequest<'_>) -> Result<DynamicImage, InpaintError> {
            push(
                &self.log,
                format!(
                    "inpaint {} {} {}x{}",
                    request.strength,
                    request.prompt,
                    request.mask.width(),
                    request.mask.height()
                ),
            );
            assert_eq!(request.image.dimensions(), request.mask.dimensions());
            if self.fail_at_strength == Some(request.strength) {
                return Err(InpaintError::Inference {
                    model: String::from("fake-inpaint"),
                    message: String::from("CUDA out of memory"),
                });
            }
            Ok(match self.output_size {
                Some((w, h)) => request.image.resize_exact(w, h, FilterType::Nearest),
                None => request.image.clone(),
            })
        }
    }

    struct FakeRefiner {
        log: EventLog,
        fail: bool,
    }

    impl LoadedModel for FakeRefiner {
        fn label(&self) -> &str {
            "fake-refiner"
        }

        fn release(&mut self) {
            push(&self.log, "release refine");
        }
    }

    impl RefinerModel for FakeRefiner {
        fn refine(&self, prompt: &str, image: &DynamicImage) -> Result<DynamicImage, InpaintError> {
            push(&self.log, format!("refine {prompt}"));
            if self.fail {
                return Err(InpaintError::Inference {
                    model: String::from("fake-refiner"),
                    message: String::from("timeout"),
                });
            }
            Ok(image.clone())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        log: EventLog,
        fail_inpaint_at: Option<f32>,
        fail_refine: bool,
        inpaint_output_size: Option<(u32, u32)>,
    }

    impl ModelProvider for FakeProvider {
        fn load_inpainter(&self) -> Result<Box<dyn InpaintModel>, InpaintError> {
            push(&self.log, "load inpaint");
            Ok(Box::new(FakeInpainter {
                log: self.log.clone(),
                fail_at_strength: self.fail_inpaint_at,
                output_size: self.inpaint_output_size,
            }))
        }

        fn load_refiner(&self) -> Result<Box<dyn RefinerModel>, InpaintError> {
            push(&self.log, "load refine");
            Ok(Box::new(FakeRefiner {
                log: self.log.clone(),
                fail: self.fail_refine,
            }))
        }
    }

    fn engine_with(provider: FakeProvider) -> (InpaintRefinementEngine, EventLog) {
        let log = provider.log.clone();
        (InpaintRefinementEngine::new(Arc::new(provider)), log)
    }

    fn events(log: &EventLog) -> Vec<String> {
        log.lock().expect("event log mutex poisoned").clone()
    }

    fn small_inputs() -> (DynamicImage, GrayImage) {
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let mask = GrayImage::from_pixel(8, 8, Luma([MASK_ON]));
        (image, mask)
    }

    #[test]
    fn strength_sequence_clamps_to_last_value() {
        assert_eq!(strength_sequence(3), vec![0.9, 0.7, 0.5]);
        assert_eq!(
            strength_sequence(7),
            vec![0.9, 0.7, 0.5, 0.4, 0.3, 0.3, 0.3]
        );
        assert_eq!(strength_for_round(100), 0.3);
    }

    #[test]
    fn single_final_refinement_runs_after_inpainter_release() {
        let (engine, log) = engine_with(FakeProvider::default());
        let (image, mask) = small_inputs();

        engine
            .run(image, &mask, "bus", &RefinementConfig::default())
            .expect("run should succeed");

        assert_eq!(
            events(&log),
            vec![
                "load inpaint",
                "inpaint 0.9 bus 8x8",
                "inpaint 0.7 bus 8x8",
                "inpaint 0.5 bus 8x8",
                "release inpaint",
                "load refine",
                "refine bus",
                "release refine",
            ]
        );
    }

    #[test]
    fn refine_each_round_interleaves_and_releases_refiner_immediately() {
        let (engine, log) = engine_with(FakeProvider::default());
        let (image, mask) = small_inputs();
        let config = RefinementConfig {
            num_rounds: 2,
            refine_each_round: true,
            use_refiner: true,
        };

        engine
            .run(image, &mask, "background", &config)
            .expect("run should succeed");

        assert_eq!(
            events(&log),
            vec![
                "load inpaint",
                "inpaint 0.9 background 8x8",
                "load refine",
                "refine background",
                "release refine",
                "inpaint 0.7 background 8x8",
                "load refine",
                "refine background",
                "release refine",
                "release inpaint",
            ]
        );
    }

    #[test]
    fn refiner_disabled_skips_every_refinement() {
        let (engine, log) = engine_with(FakeProvider::default());
        let (image, mask) = small_inputs();
        let config = RefinementConfig {
            num_rounds: 1,
            refine_each_round: true,
            use_refiner: false,
        };

        engine.run(image, &mask, "bus", &config).expect("run");
        assert!(events(&log).iter().all(|e| !e.contains("refine")));
    }

    #[test]
    fn failure_mid_loop_still_releases_inpainter() {
        let (engine, log) = engine_with(FakeProvider {
            fail_inpaint_at: Some(0.7),
            ..FakeProvider::default()
        });
        let (image, mask) = small_inputs();

        let err = engine
            .run(image, &mask, "bus", &RefinementConfig::default())
            .expect_err("second round should fail");
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(
            events(&log),
            vec![
                "load inpaint",
                "inpaint 0.9 bus 8x8",
                "inpaint 0.7 bus 8x8",
                "release inpaint",
            ]
        );
    }

    #[test]
    fn refiner_failure_releases_both_models() {
        let (engine, log) = engine_with(FakeProvider {
            fail_refine: true,
            ..FakeProvider::default()
        });
        let (image, mask) = small_inputs();
        let config = RefinementConfig {
            num_rounds: 3,
            refine_each_round: true,
            use_refiner: true,
        };

        engine
            .run(image, &mask, "bus", &config)
            .expect_err("refiner failure should propagate");
        let seen = events(&log);
        assert_eq!(
            &seen[seen.len() - 2..],
            &[String::from("release refine"), String::from("release inpaint")]
        );
    }

    #[test]
    fn oversized_image_is_downscaled_and_mask_follows() {
        let (engine, log) = engine_with(FakeProvider::default());
        let image = DynamicImage::ImageRgb8(RgbImage::new(2048, 1024));
        let mask = GrayImage::new(16, 16);
        let config = RefinementConfig {
            num_rounds: 1,
            refine_each_round: false,
            use_refiner: false,
        };

        let out = engine.run(image, &mask, "lamp", &config).expect("run");
        assert_eq!(out.dimensions(), (1024, 512));
        assert!(events(&log).contains(&String::from("inpaint 0.9 lamp 1024x512")));
    }

    #[test]
    fn mask_follows_inpaint_output_that_changes_size() {
        let (engine, log) = engine_with(FakeProvider {
            inpaint_output_size: Some((16, 16)),
            ..FakeProvider::default()
        });
        let image = DynamicImage::ImageRgb8(RgbImage::new(12, 8));
        let mask = GrayImage::from_pixel(12, 8, Luma([MASK_ON]));
        let config = RefinementConfig {
            num_rounds: 2,
            use_refiner: false,
            ..RefinementConfig::default()
        };

        let out = engine
            .run(image, &mask, "background", &config)
            .expect("run should succeed");

        assert_eq!(out.dimensions(), (16, 16));
        assert_eq!(
            events(&log),
            vec![
                "load inpaint",
                "inpaint 0.9 background 12x8",
                "inpaint 0.7 background 16x16",
                "release inpaint",
            ]
        );
    }

    #[test]
    fn zero_rounds_is_rejected_before_loading() {
        let (engine, log) = engine_with(FakeProvider::default());
        let (image, mask) = small_inputs();
        let config = RefinementConfig {
            num_rounds: 0,
            ..RefinementConfig::default()
        };

        assert!(matches!(
            engine.run(image, &mask, "bus", &config),
            Err(InpaintError::InvalidRounds)
        ));
        assert!(events(&log).is_empty());
    }
}
