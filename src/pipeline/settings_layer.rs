use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::pipeline::dotenv_utils::{load_dotenv_map, lookup_env_or_dotenv};
use crate::pipeline::EndpointDescriptor;

pub const DEFAULT_SETTINGS_REL_PATH: &str = "config/mirage.settings.toml";

/// Resolved configuration for one process. Built once at startup and handed
/// to the pipeline by value; nothing reads it from global state.
#[derive(Debug, Clone, PartialEq)]
pub struct MirageSettings {
    pub llm_base_url: String,
    pub llm_api_key_env: String,
    pub llm_api_key: Option<String>,
    pub enhance_model: String,
    pub extract_model: String,
    pub enhance_temperature: f32,
    pub hf_token_env: String,
    pub hf_token: Option<String>,
    pub http_timeout_secs: u64,
    pub segmentation_endpoints: Vec<EndpointDescriptor>,
    pub quota_backoff_secs: u64,
    pub inpaint_space: String,
    pub inpaint_api_name: String,
    pub refiner_space: String,
    pub refiner_api_name: String,
    pub num_rounds: u32,
    pub refine_each_round: bool,
    pub use_refiner: bool,
    pub max_dimension: u32,
    pub bind: String,
}

impl Default for MirageSettings {
    fn default() -> Self {
        Self {
            llm_base_url: String::from("https://api.groq.com/openai/v1"),
            llm_api_key_env: String::from("GROQ_API_KEY"),
            llm_api_key: None,
            enhance_model: String::from("llama-3.1-8b-instant"),
            extract_model: String::from("llama-3.1-8b-instant"),
            enhance_temperature: 0.7,
            hf_token_env: String::from("HF_TOKEN"),
            hf_token: None,
            http_timeout_secs: 300,
            segmentation_endpoints: vec![EndpointDescriptor::new(
                "evf-sam2",
                "wondervictor/evf-sam2",
            )],
            quota_backoff_secs: 10,
            inpaint_space: String::from("IotaCluster/Inpaint_Refine"),
            inpaint_api_name: String::from("/inpaint_with_mask"),
            refiner_space: String::from("IotaCluster/Inpaint_Refine"),
            refiner_api_name: String::from("/refine"),
            num_rounds: 3,
            refine_each_round: false,
            use_refiner: true,
            max_dimension: 1024,
            bind: String::from("127.0.0.1:8017"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MirageSettingsOverlay {
    pub llm_base_url: Option<String>,
    pub llm_api_key_env: Option<String>,
    pub enhance_model: Option<String>,
    pub extract_model: Option<String>,
    pub enhance_temperature: Option<f32>,
    pub hf_token_env: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub segmentation_endpoints: Option<Vec<EndpointDescriptor>>,
    pub quota_backoff_secs: Option<u64>,
    pub inpaint_space: Option<String>,
    pub inpaint_api_name: Option<String>,
    pub refiner_space: Option<String>,
    pub refiner_api_name: Option<String>,
    pub num_rounds: Option<u32>,
    pub refine_each_round: Option<bool>,
    pub use_refiner: Option<bool>,
    pub max_dimension: Option<u32>,
    pub bind: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsLayerError {
    #[error("failed to read mirage settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse mirage settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("mirage settings root must be a table")]
    RootMustBeObject,
    #[error("mirage settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
}

/// Defaults, then the TOML file, then environment (process env beats `.env`).
pub fn load_mirage_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<MirageSettings, SettingsLayerError> {
    let file_overlay = load_settings_file_overlay(app_root, explicit_path)?;
    let dotenv = load_dotenv_map(app_root).unwrap_or_else(|error| {
        warn!(
            path = %app_root.join(".env").display(),
            %error,
            "ignoring unreadable .env file"
        );
        HashMap::new()
    });
    let env_overlay = settings_overlay_from_env(&dotenv)?;
    let merged = merge_settings_overlays(&file_overlay, &env_overlay);

    let mut settings = MirageSettings::default();
    settings.apply_overlay(&merged);
    settings.llm_api_key = lookup_env_or_dotenv(&dotenv, settings.llm_api_key_env.as_str());
    settings.hf_token = lookup_env_or_dotenv(&dotenv, settings.hf_token_env.as_str());
    Ok(settings)
}

impl MirageSettings {
    pub fn apply_overlay(&mut self, overlay: &MirageSettingsOverlay) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        set(&mut self.llm_base_url, &overlay.llm_base_url);
        set(&mut self.llm_api_key_env, &overlay.llm_api_key_env);
        set(&mut self.enhance_model, &overlay.enhance_model);
        set(&mut self.extract_model, &overlay.extract_model);
        set(&mut self.enhance_temperature, &overlay.enhance_temperature);
        set(&mut self.hf_token_env, &overlay.hf_token_env);
        set(&mut self.http_timeout_secs, &overlay.http_timeout_secs);
        set(
            &mut self.segmentation_endpoints,
            &overlay.segmentation_endpoints,
        );
        set(&mut self.quota_backoff_secs, &overlay.quota_backoff_secs);
        set(&mut self.inpaint_space, &overlay.inpaint_space);
        set(&mut self.inpaint_api_name, &overlay.inpaint_api_name);
        set(&mut self.refiner_space, &overlay.refiner_space);
        set(&mut self.refiner_api_name, &overlay.refiner_api_name);
        set(&mut self.num_rounds, &overlay.num_rounds);
        set(&mut self.refine_each_round, &overlay.refine_each_round);
        set(&mut self.use_refiner, &overlay.use_refiner);
        set(&mut self.max_dimension, &overlay.max_dimension);
        set(&mut self.bind, &overlay.bind);
    }
}

pub fn load_settings_file_overlay(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<MirageSettingsOverlay, SettingsLayerError> {
    let path = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
        .unwrap_or_else(|| app_root.join(DEFAULT_SETTINGS_REL_PATH));
    if !path.exists() {
        return Ok(MirageSettingsOverlay::default());
    }
    let raw = fs::read_to_string(path.as_path()).map_err(|error| SettingsLayerError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    parse_settings_overlay_toml(raw.as_str()).map_err(|error| match error {
        SettingsLayerError::ParseToml { message, .. } => SettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })
}

pub fn parse_settings_overlay_toml(raw: &str) -> Result<MirageSettingsOverlay, SettingsLayerError> {
    let parsed =
        toml::from_str::<toml::Value>(raw).map_err(|error| SettingsLayerError::ParseToml {
            path: String::from("<inline>"),
            message: error.to_string(),
        })?;
    let json_value =
        serde_json::to_value(parsed).map_err(|error| SettingsLayerError::ParseToml {
            path: String::from("<inline>"),
            message: error.to_string(),
        })?;
    parse_settings_overlay_value(&json_value)
}

pub fn parse_settings_overlay_value(
    value: &Value,
) -> Result<MirageSettingsOverlay, SettingsLayerError> {
    let root = value
        .as_object()
        .ok_or(SettingsLayerError::RootMustBeObject)?;
    let mut out = MirageSettingsOverlay::default();

    if let Some(llm) = section(root.get("llm"), "llm")? {
        if let Some(v) = llm.get("base_url") {
            out.llm_base_url = Some(parse_string(v, "llm.base_url")?);
        }
        if let Some(v) = llm.get("api_key_env") {
            out.llm_api_key_env = Some(parse_string(v, "llm.api_key_env")?);
        }
        if let Some(v) = llm.get("enhance_model") {
            out.enhance_model = Some(parse_string(v, "llm.enhance_model")?);
        }
        if let Some(v) = llm.get("extract_model") {
            out.extract_model = Some(parse_string(v, "llm.extract_model")?);
        }
        if let Some(v) = llm.get("enhance_temperature") {
            out.enhance_temperature = Some(parse_temperature(v, "llm.enhance_temperature")?);
        }
    }
    if let Some(hf) = section(root.get("huggingface"), "huggingface")? {
        if let Some(v) = hf.get("token_env") {
            out.hf_token_env = Some(parse_string(v, "huggingface.token_env")?);
        }
    }
    if let Some(http) = section(root.get("http"), "http")? {
        if let Some(v) = http.get("timeout_secs") {
            out.http_timeout_secs = Some(parse_u64(v, "http.timeout_secs")?);
        }
    }
    if let Some(seg) = section(root.get("segmentation"), "segmentation")? {
        if let Some(v) = seg.get("quota_backoff_secs") {
            out.quota_backoff_secs = Some(parse_u64(v, "segmentation.quota_backoff_secs")?);
        }
        if let Some(v) = seg.get("endpoints") {
            out.segmentation_endpoints = Some(parse_endpoints(v, "segmentation.endpoints")?);
        }
    }
    if let Some(inpaint) = section(root.get("inpaint"), "inpaint")? {
        if let Some(v) = inpaint.get("space") {
            out.inpaint_space = Some(parse_string(v, "inpaint.space")?);
        }
        if let Some(v) = inpaint.get("api_name") {
            out.inpaint_api_name = Some(parse_string(v, "inpaint.api_name")?);
        }
        if let Some(v) = inpaint.get("refiner_space") {
            out.refiner_space = Some(parse_string(v, "inpaint.refiner_space")?);
        }
        if let Some(v) = inpaint.get("refiner_api_name") {
            out.refiner_api_name = Some(parse_string(v, "inpaint.refiner_api_name")?);
        }
        if let Some(v) = inpaint.get("num_rounds") {
            out.num_rounds = Some(parse_positive_u32(v, "inpaint.num_rounds")?);
        }
        if let Some(v) = inpaint.get("refine_each_round") {
            out.refine_each_round = Some(parse_bool(v, "inpaint.refine_each_round")?);
        }
        if let Some(v) = inpaint.get("use_refiner") {
            out.use_refiner = Some(parse_bool(v, "inpaint.use_refiner")?);
        }
        if let Some(v) = inpaint.get("max_dimension") {
            out.max_dimension = Some(parse_positive_u32(v, "inpaint.max_dimension")?);
        }
    }
    if let Some(server) = section(root.get("server"), "server")? {
        if let Some(v) = server.get("bind") {
            out.bind = Some(parse_string(v, "server.bind")?);
        }
    }
    Ok(out)
}

/// Environment keys recognised on top of the file layer.
pub fn settings_overlay_from_env(
    dotenv: &HashMap<String, String>,
) -> Result<MirageSettingsOverlay, SettingsLayerError> {
    let mut out = MirageSettingsOverlay {
        llm_base_url: lookup_env_or_dotenv(dotenv, "MIRAGE_LLM_BASE_URL"),
        enhance_model: lookup_env_or_dotenv(dotenv, "MIRAGE_ENHANCE_MODEL"),
        extract_model: lookup_env_or_dotenv(dotenv, "MIRAGE_EXTRACT_MODEL"),
        inpaint_space: lookup_env_or_dotenv(dotenv, "MIRAGE_INPAINT_SPACE"),
        refiner_space: lookup_env_or_dotenv(dotenv, "MIRAGE_REFINER_SPACE"),
        bind: lookup_env_or_dotenv(dotenv, "MIRAGE_BIND"),
        ..MirageSettingsOverlay::default()
    };
    if let Some(raw) = lookup_env_or_dotenv(dotenv, "MIRAGE_SEGMENTATION_ENDPOINTS") {
        out.segmentation_endpoints = Some(parse_endpoint_list_env(raw.as_str())?);
    }
    if let Some(raw) = lookup_env_or_dotenv(dotenv, "MIRAGE_QUOTA_BACKOFF_SECS") {
        out.quota_backoff_secs =
            Some(
                raw.parse::<u64>()
                    .map_err(|_| SettingsLayerError::InvalidFieldType {
                        field: String::from("MIRAGE_QUOTA_BACKOFF_SECS"),
                    })?,
            );
    }
    Ok(out)
}

pub fn merge_settings_overlays(
    file: &MirageSettingsOverlay,
    env: &MirageSettingsOverlay,
) -> MirageSettingsOverlay {
    MirageSettingsOverlay {
        llm_base_url: env.llm_base_url.clone().or_else(|| file.llm_base_url.clone()),
        llm_api_key_env: env
            .llm_api_key_env
            .clone()
            .or_else(|| file.llm_api_key_env.clone()),
        enhance_model: env
            .enhance_model
            .clone()
            .or_else(|| file.enhance_model.clone()),
        extract_model: env
            .extract_model
            .clone()
            .or_else(|| file.extract_model.clone()),
        enhance_temperature: env.enhance_temperature.or(file.enhance_temperature),
        hf_token_env: env.hf_token_env.clone().or_else(|| file.hf_token_env.clone()),
        http_timeout_secs: env.http_timeout_secs.or(file.http_timeout_secs),
        segmentation_endpoints: env
            .segmentation_endpoints
            .clone()
            .or_else(|| file.segmentation_endpoints.clone()),
        quota_backoff_secs: env.quota_backoff_secs.or(file.quota_backoff_secs),
        inpaint_space: env
            .inpaint_space
            .clone()
            .or_else(|| file.inpaint_space.clone()),
        inpaint_api_name: env
            .inpaint_api_name
            .clone()
            .or_else(|| file.inpaint_api_name.clone()),
        refiner_space: env
            .refiner_space
            .clone()
            .or_else(|| file.refiner_space.clone()),
        refiner_api_name: env
            .refiner_api_name
            .clone()
            .or_else(|| file.refiner_api_name.clone()),
        num_rounds: env.num_rounds.or(file.num_rounds),
        refine_each_round: env.refine_each_round.or(file.refine_each_round),
        use_refiner: env.use_refiner.or(file.use_refiner),
        max_dimension: env.max_dimension.or(file.max_dimension),
        bind: env.bind.clone().or_else(|| file.bind.clone()),
    }
}

/// `name=uri` pairs separated by commas; a bare `uri` names itself.
fn parse_endpoint_list_env(raw: &str) -> Result<Vec<EndpointDescriptor>, SettingsLayerError> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, uri)) => EndpointDescriptor::new(name.trim(), uri.trim()),
            None => EndpointDescriptor::new(entry, entry),
        })
        .collect::<Vec<_>>();
    if endpoints.is_empty() || endpoints.iter().any(|e| e.uri.is_empty()) {
        return Err(SettingsLayerError::InvalidFieldType {
            field: String::from("MIRAGE_SEGMENTATION_ENDPOINTS"),
        });
    }
    Ok(endpoints)
}

fn section<'a>(
    value: Option<&'a Value>,
    field: &str,
) -> Result<Option<&'a serde_json::Map<String, Value>>, SettingsLayerError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .as_object()
            .map(Some)
            .ok_or_else(|| SettingsLayerError::InvalidFieldType {
                field: field.to_string(),
            }),
    }
}

fn parse_endpoints(
    value: &Value,
    field: &str,
) -> Result<Vec<EndpointDescriptor>, SettingsLayerError> {
    let arr = value
        .as_array()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let obj = item
            .as_object()
            .ok_or_else(|| SettingsLayerError::InvalidFieldType {
                field: field.to_string(),
            })?;
        let uri = parse_string(
            obj.get("uri").unwrap_or(&Value::Null),
            format!("{field}.uri").as_str(),
        )?;
        let name = match obj.get("name") {
            Some(v) => parse_string(v, format!("{field}.name").as_str())?,
            None => uri.clone(),
        };
        out.push(EndpointDescriptor { name, uri });
    }
    Ok(out)
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsLayerError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_bool(value: &Value, field: &str) -> Result<bool, SettingsLayerError> {
    value
        .as_bool()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_u64(value: &Value, field: &str) -> Result<u64, SettingsLayerError> {
    value
        .as_u64()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_positive_u32(value: &Value, field: &str) -> Result<u32, SettingsLayerError> {
    parse_u64(value, field)?
        .try_into()
        .ok()
        .filter(|v: &u32| *v >= 1)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_temperature(value: &Value, field: &str) -> Result<f32, SettingsLayerError> {
    value
        .as_f64()
        .filter(|v| (0.0..=2.0).contains(v))
        .map(|v| v as f32)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })
}
