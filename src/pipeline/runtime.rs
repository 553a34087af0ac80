use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::image_io::open_rgb;
use crate::pipeline::inpaint::{InpaintError, InpaintRefinementEngine, RefinementConfig};
use crate::pipeline::instruction::{InstructionInterpreter, InterpreterError, InterpreterOptions};
use crate::pipeline::llm::{OpenAiCompatibleChatClient, SharedChatCompletion};
use crate::pipeline::remote_models::{RemoteModelEndpoint, RemoteModelProvider};
use crate::pipeline::segmentation::{
    GradioSegmentationBackend, MaskAcquisition, SharedSegmentationBackend,
};
use crate::pipeline::settings_layer::MirageSettings;

/// Per-request overrides of the configured refinement defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditOptions {
    pub num_rounds: Option<u32>,
    pub refine_each_round: Option<bool>,
    pub use_refiner: Option<bool>,
}

impl EditOptions {
    pub fn resolve(&self, defaults: &RefinementConfig) -> RefinementConfig {
        RefinementConfig {
            num_rounds: self.num_rounds.unwrap_or(defaults.num_rounds).max(1),
            refine_each_round: self
                .refine_each_round
                .unwrap_or(defaults.refine_each_round),
            use_refiner: self.use_refiner.unwrap_or(defaults.use_refiner),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineRuntimeError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error("inpainting failed: {0}")]
    Inpaint(#[from] InpaintError),
    #[error("pipeline setup failed: {0}")]
    Setup(String),
}

pub trait PromptEditOrchestrator: Send + Sync + 'static {
    fn run_prompt_edit_image(
        &self,
        image: DynamicImage,
        prompt: &str,
        options: &EditOptions,
    ) -> Result<DynamicImage, PipelineRuntimeError>;
}

pub type SharedPromptEditOrchestrator = Arc<dyn PromptEditOrchestrator>;

/// Composes interpreter, mask acquisition and the inpaint engine. Holds no
/// per-request state, so one value serves concurrent requests.
#[derive(Clone)]
pub struct EditPipeline {
    interpreter: InstructionInterpreter,
    masks: MaskAcquisition,
    engine: InpaintRefinementEngine,
    defaults: RefinementConfig,
}

impl EditPipeline {
    pub fn new(
        interpreter: InstructionInterpreter,
        masks: MaskAcquisition,
        engine: InpaintRefinementEngine,
        defaults: RefinementConfig,
    ) -> Self {
        Self {
            interpreter,
            masks,
            engine,
            defaults,
        }
    }

    /// Builds the remote-backed pipeline. Must run outside an async context:
    /// the HTTP clients are blocking.
    pub fn from_settings(settings: &MirageSettings) -> Result<Self, PipelineRuntimeError> {
        let timeout = Duration::from_secs(settings.http_timeout_secs);
        let llm: SharedChatCompletion = Arc::new(
            OpenAiCompatibleChatClient::new(
                settings.llm_base_url.as_str(),
                settings.llm_api_key.clone(),
                settings.llm_api_key_env.as_str(),
                timeout,
            )
            .map_err(|e| PipelineRuntimeError::Setup(e.to_string()))?,
        );
        if settings.llm_api_key.is_none() {
            warn!(
                env = settings.llm_api_key_env.as_str(),
                "language model API key not set; edits will fail until it is"
            );
        }

        let interpreter = InstructionInterpreter::new(
            llm,
            InterpreterOptions {
                enhance_model: settings.enhance_model.clone(),
                extract_model: settings.extract_model.clone(),
                enhance_temperature: settings.enhance_temperature,
                ..InterpreterOptions::default()
            },
        );

        let endpoints = settings
            .segmentation_endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(GradioSegmentationBackend::new(
                    endpoint.clone(),
                    settings.hf_token.clone(),
                    timeout,
                )) as SharedSegmentationBackend
            })
            .collect::<Vec<_>>();
        let masks = MaskAcquisition::new(
            endpoints,
            Duration::from_secs(settings.quota_backoff_secs),
        );

        let models = RemoteModelProvider::new(
            RemoteModelEndpoint {
                space: settings.inpaint_space.clone(),
                api_name: settings.inpaint_api_name.clone(),
            },
            RemoteModelEndpoint {
                space: settings.refiner_space.clone(),
                api_name: settings.refiner_api_name.clone(),
            },
            settings.hf_token.clone(),
            timeout,
        );
        let engine =
            InpaintRefinementEngine::new(Arc::new(models)).with_max_dimension(settings.max_dimension);

        Ok(Self::new(
            interpreter,
            masks,
            engine,
            RefinementConfig {
                num_rounds: settings.num_rounds.max(1),
                refine_each_round: settings.refine_each_round,
                use_refiner: settings.use_refiner,
            },
        ))
    }

    pub fn defaults(&self) -> &RefinementConfig {
        &self.defaults
    }

    pub fn run_prompt_edit(
        &self,
        image_path: &Path,
        prompt: &str,
        options: &EditOptions,
    ) -> Result<DynamicImage, PipelineRuntimeError> {
        let image = open_rgb(image_path)?;
        self.run_prompt_edit_image(image, prompt, options)
    }
}

impl PromptEditOrchestrator for EditPipeline {
    fn run_prompt_edit_image(
        &self,
        image: DynamicImage,
        prompt: &str,
        options: &EditOptions,
    ) -> Result<DynamicImage, PipelineRuntimeError> {
        let enhanced = self.interpreter.enhance_prompt(prompt)?;
        let mut instructions = self.interpreter.parse_instructions(enhanced.as_str())?;
        if instructions.is_empty() {
            info!(prompt, "no edit instruction found; returning input unchanged");
            return Ok(image);
        }

        let instruction = instructions.remove(0);
        if !instructions.is_empty() {
            // Only one edit per request is applied.
            warn!(
                discarded = ?instructions,
                "ignoring additional edit instructions"
            );
        }

        let object = instruction.object();
        let inpaint_prompt = instruction.inpaint_prompt();
        info!(
            action = instruction.action().as_str(),
            object,
            inpaint_prompt,
            "applying edit instruction"
        );

        let outcome = self.masks.acquire_mask(&image, object);
        let config = options.resolve(&self.defaults);
        let edited = self
            .engine
            .run(image, outcome.mask(), inpaint_prompt, &config)?;
        Ok(edited)
    }
}

pub fn default_app_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}
