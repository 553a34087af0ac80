//! Minimal blocking client for Gradio Spaces (`/gradio_api/*` routes).
//!
//! A call is two requests: `POST call/{api}` returns an event id, then
//! `GET call/{api}/{event_id}` streams server-sent events until `complete`
//! (payload is the output array) or `error` (payload is the failure text).

use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum GradioError {
    #[error("invalid Space address '{0}'")]
    InvalidSpace(String),
    #[error("Gradio request failed: {0}")]
    Transport(String),
    #[error("Gradio HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Gradio upload returned no file path")]
    EmptyUpload,
    #[error("Gradio call returned no event id")]
    MissingEventId,
    #[error("Gradio app error: {0}")]
    App(String),
    #[error("Gradio event stream ended without a result")]
    StreamEnded,
    #[error("Gradio output has unexpected shape: {0}")]
    UnexpectedOutput(String),
}

#[derive(Debug, Deserialize)]
struct CallStarted {
    #[serde(default)]
    event_id: Option<String>,
}

/// Resolves `owner/name` to its `*.hf.space` host; full URLs pass through.
pub fn resolve_space_root(space: &str) -> Result<Url, GradioError> {
    let trimmed = space.trim();
    let raw = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else {
        let Some((owner, name)) = trimmed.split_once('/') else {
            return Err(GradioError::InvalidSpace(space.to_string()));
        };
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(GradioError::InvalidSpace(space.to_string()));
        }
        let host = format!("{owner}-{name}")
            .to_ascii_lowercase()
            .replace(['_', '.'], "-");
        format!("https://{host}.hf.space")
    };
    Url::parse(format!("{raw}/").as_str()).map_err(|_| GradioError::InvalidSpace(space.to_string()))
}

/// File parameter referencing an uploaded server path.
pub fn file_data(path: &str, orig_name: &str) -> Value {
    json!({
        "path": path,
        "orig_name": orig_name,
        "meta": {"_type": "gradio.FileData"}
    })
}

#[derive(Debug, Clone)]
pub struct GradioClient {
    client: Client,
    root: Url,
    token: Option<String>,
}

impl GradioClient {
    pub fn connect(
        space: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GradioError> {
        let root = resolve_space_root(space)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GradioError::Transport(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            root,
            token,
        })
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Uploads PNG bytes and returns a ready-to-send file parameter.
    pub fn upload_png(&self, bytes: Vec<u8>, file_name: &str) -> Result<Value, GradioError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/png")
            .map_err(|e| GradioError::Transport(format!("invalid mime: {e}")))?;
        let form = multipart::Form::new().part("files", part);
        let resp = self
            .authorized(self.client.post(self.endpoint("gradio_api/upload")?))
            .multipart(form)
            .send()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        let paths: Vec<String> = Self::ok_json(resp)?;
        let path = paths.into_iter().next().ok_or(GradioError::EmptyUpload)?;
        Ok(file_data(path.as_str(), file_name))
    }

    /// Runs a named endpoint to completion and returns its output array.
    pub fn predict(&self, api_name: &str, data: Vec<Value>) -> Result<Vec<Value>, GradioError> {
        let api = api_name.trim().trim_start_matches('/');
        let call_url = self.endpoint(format!("gradio_api/call/{api}").as_str())?;
        debug!(root = self.root.as_str(), api, "starting Gradio call");
        let resp = self
            .authorized(self.client.post(call_url))
            .json(&json!({ "data": data }))
            .send()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        let started: CallStarted = Self::ok_json(resp)?;
        let event_id = started
            .event_id
            .filter(|v| !v.trim().is_empty())
            .ok_or(GradioError::MissingEventId)?;

        let result_url = self.endpoint(format!("gradio_api/call/{api}/{event_id}").as_str())?;
        let resp = self
            .authorized(self.client.get(result_url))
            .send()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(GradioError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_event_stream(body.as_str())
    }

    /// Downloads a file output (`{"url": ..}` or `{"path": ..}`) or a bare path string.
    pub fn download_file(&self, output: &Value) -> Result<Vec<u8>, GradioError> {
        let url = match output {
            Value::String(path) => self.file_url(path)?,
            Value::Object(obj) => match obj.get("url").and_then(Value::as_str) {
                Some(url) if !url.trim().is_empty() => Url::parse(url)
                    .map_err(|e| GradioError::UnexpectedOutput(format!("bad file url: {e}")))?,
                _ => {
                    let path = obj.get("path").and_then(Value::as_str).ok_or_else(|| {
                        GradioError::UnexpectedOutput(String::from("file output has no url or path"))
                    })?;
                    self.file_url(path)?
                }
            },
            other => return Err(GradioError::UnexpectedOutput(other.to_string())),
        };
        let resp = self
            .authorized(self.client.get(url))
            .send()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(GradioError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp
            .bytes()
            .map_err(|e| GradioError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn file_url(&self, path: &str) -> Result<Url, GradioError> {
        self.endpoint(format!("gradio_api/file={path}").as_str())
    }

    fn endpoint(&self, rel: &str) -> Result<Url, GradioError> {
        self.root
            .join(rel)
            .map_err(|e| GradioError::InvalidSpace(format!("{}{rel}: {e}", self.root)))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn ok_json<T>(resp: reqwest::blocking::Response) -> Result<T, GradioError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(GradioError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .map_err(|e| GradioError::UnexpectedOutput(e.to_string()))
    }
}

/// Scans an SSE body for the terminal event. Heartbeats and `generating`
/// frames are skipped; the last `complete` or the first `error` wins.
pub fn parse_event_stream(body: &str) -> Result<Vec<Value>, GradioError> {
    let mut event = String::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim().to_string();
            continue;
        }
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        match event.as_str() {
            "complete" => {
                let parsed: Value = serde_json::from_str(data)
                    .map_err(|e| GradioError::UnexpectedOutput(format!("{e}: {data}")))?;
                return match parsed {
                    Value::Array(items) => Ok(items),
                    other => Err(GradioError::UnexpectedOutput(other.to_string())),
                };
            }
            "error" => return Err(GradioError::App(error_message(data))),
            _ => {}
        }
    }
    Err(GradioError::StreamEnded)
}

fn error_message(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(message)) => message,
        Ok(Value::Null) => String::from("remote app raised an error without a message"),
        Ok(other) => other.to_string(),
        Err(_) if data.is_empty() => String::from("remote app raised an error without a message"),
        Err(_) => data.to_string(),
    }
}
