use axum::extract::{Multipart, State};
use axum::response::Response;
use tracing::info;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::response::{png_attachment, EDITED_IMAGE_FILE_NAME};
use crate::api::server::AppState;
use crate::pipeline::image_io::{decode_rgb, encode_png};
use crate::pipeline::runtime::{EditOptions, PipelineRuntimeError};

#[derive(Debug, Default)]
struct EditForm {
    image: Option<Vec<u8>>,
    prompt: Option<String>,
    options: EditOptions,
}

enum EditTaskError {
    InvalidImage(image::ImageError),
    Pipeline(PipelineRuntimeError),
}

pub async fn edit_image_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_edit_form(multipart).await?;
    let image = form
        .image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ApiError::unprocessable("missing form field: image"))?;
    let prompt = form
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::unprocessable("missing form field: prompt"))?;
    let options = form.options;
    let request_id = Uuid::new_v4();
    info!(%request_id, bytes = image.len(), prompt = prompt.as_str(), "edit-image request");

    let orchestrator = state.orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        let input = decode_rgb(image.as_slice()).map_err(EditTaskError::InvalidImage)?;
        let edited = orchestrator
            .run_prompt_edit_image(input, prompt.as_str(), &options)
            .map_err(EditTaskError::Pipeline)?;
        encode_png(&edited).map_err(|e| EditTaskError::Pipeline(PipelineRuntimeError::Image(e)))
    })
    .await;

    match result {
        Ok(Ok(png)) => {
            info!(%request_id, bytes = png.len(), "edit-image response");
            Ok(png_attachment(png, EDITED_IMAGE_FILE_NAME))
        }
        Ok(Err(EditTaskError::InvalidImage(error))) => Err(ApiError::bad_request(
            "invalid_image",
            format!("uploaded file is not a readable image: {error}"),
        )),
        Ok(Err(EditTaskError::Pipeline(error))) => Err(error.into()),
        Err(join_error) => Err(ApiError::internal(format!(
            "edit task failed: {join_error}"
        ))),
    }
}

async fn read_edit_form(mut multipart: Multipart) -> Result<EditForm, ApiError> {
    let mut form = EditForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("invalid_multipart", e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_multipart", e.body_text()))?;
                form.image = Some(bytes.to_vec());
            }
            "prompt" | "num_rounds" | "refine_each_round" | "use_refiner" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_multipart", e.body_text()))?;
                apply_text_field(&mut form, name.as_str(), text)?;
            }
            _ => {}
        }
    }
    Ok(form)
}

fn apply_text_field(form: &mut EditForm, name: &str, text: String) -> Result<(), ApiError> {
    if name == "prompt" {
        form.prompt = Some(text);
        return Ok(());
    }
    let value = text.trim();
    match name {
        "num_rounds" if !value.is_empty() => {
            let rounds = value.parse::<u32>().map_err(|_| {
                ApiError::unprocessable(format!("num_rounds must be a positive integer, got '{value}'"))
            })?;
            if rounds == 0 {
                return Err(ApiError::unprocessable("num_rounds must be at least 1"));
            }
            form.options.num_rounds = Some(rounds);
        }
        "refine_each_round" if !value.is_empty() => {
            form.options.refine_each_round = Some(parse_form_bool(name, value)?);
        }
        "use_refiner" if !value.is_empty() => {
            form.options.use_refiner = Some(parse_form_bool(name, value)?);
        }
        _ => {}
    }
    Ok(())
}

fn parse_form_bool(field: &str, value: &str) -> Result<bool, ApiError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ApiError::unprocessable(format!(
            "{field} must be a boolean, got '{value}'"
        ))),
    }
}
