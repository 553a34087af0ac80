use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{Method, Request, StatusCode};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use mirage_edit_core::api::server::{build_router, AppState};
use mirage_edit_core::pipeline::image_io::{decode_rgb, encode_png};
use mirage_edit_core::pipeline::inpaint::InpaintError;
use mirage_edit_core::pipeline::runtime::{
    EditOptions, PipelineRuntimeError, PromptEditOrchestrator,
};

/// Inverts the image, or fails with an inpaint error when `fail` is set.
#[derive(Default)]
struct FakeOrchestrator {
    fail: bool,
    seen: Mutex<Vec<(String, EditOptions)>>,
}

impl PromptEditOrchestrator for FakeOrchestrator {
    fn run_prompt_edit_image(
        &self,
        image: DynamicImage,
        prompt: &str,
        options: &EditOptions,
    ) -> Result<DynamicImage, PipelineRuntimeError> {
        self.seen
            .lock()
            .expect("fake orchestrator mutex poisoned")
            .push((prompt.to_string(), *options));
        if self.fail {
            return Err(PipelineRuntimeError::Inpaint(InpaintError::Inference {
                model: String::from("inpainter"),
                message: String::from("space is sleeping"),
            }));
        }
        let mut inverted = image;
        inverted.invert();
        Ok(inverted)
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, Vec<u8>),
}

fn multipart_request(uri: &str, parts: Vec<Part<'_>>) -> Request<Body> {
    let boundary = format!("mirage-{}", Uuid::new_v4().simple());
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File(name, file_name, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes.as_slice());
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .expect("request should build")
}

fn sample_png() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 4, Rgb([10, 20, 30])));
    encode_png(&image).expect("fixture should encode")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    serde_json::from_slice(bytes.as_ref()).expect("body should be json")
}

#[tokio::test]
async fn root_reports_backend_running() {
    let app = build_router(AppState::new(Arc::new(FakeOrchestrator::default())));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"ok": true, "message": "MIRAGE backend is running."})
    );
}

#[tokio::test]
async fn edit_image_returns_png_attachment() {
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let app = build_router(AppState::new(orchestrator.clone()));

    let response = app
        .oneshot(multipart_request(
            "/edit-image/",
            vec![
                Part::File("image", "photo.png", sample_png()),
                Part::Text("prompt", "remove tiger"),
                Part::Text("num_rounds", "2"),
                Part::Text("refine_each_round", "true"),
            ],
        ))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"edited_image.png\""
    );
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let edited = decode_rgb(bytes.as_ref()).expect("response should be a png");
    assert_eq!(edited.to_rgb8().get_pixel(0, 0), &Rgb([245, 235, 225]));

    let seen = orchestrator
        .seen
        .lock()
        .expect("fake orchestrator mutex poisoned");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "remove tiger");
    assert_eq!(seen[0].1.num_rounds, Some(2));
    assert_eq!(seen[0].1.refine_each_round, Some(true));
}

#[tokio::test]
async fn missing_prompt_is_unprocessable() {
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let app = build_router(AppState::new(orchestrator.clone()));

    let response = app
        .oneshot(multipart_request(
            "/edit-image/",
            vec![Part::File("image", "photo.png", sample_png())],
        ))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error"], json!("missing form field: prompt"));
    assert!(orchestrator
        .seen
        .lock()
        .expect("fake orchestrator mutex poisoned")
        .is_empty());
}

#[tokio::test]
async fn missing_image_is_unprocessable() {
    let app = build_router(AppState::new(Arc::new(FakeOrchestrator::default())));

    let response = app
        .oneshot(multipart_request(
            "/edit-image/",
            vec![Part::Text("prompt", "remove tiger")],
        ))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        json_body(response).await["error"],
        json!("missing form field: image")
    );
}

#[tokio::test]
async fn undecodable_upload_is_bad_request() {
    let app = build_router(AppState::new(Arc::new(FakeOrchestrator::default())));

    let response = app
        .oneshot(multipart_request(
            "/edit-image/",
            vec![
                Part::File("image", "notes.png", b"definitely not an image".to_vec()),
                Part::Text("prompt", "remove tiger"),
            ],
        ))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], json!("invalid_image"));
}

#[tokio::test]
async fn pipeline_failure_is_server_error_with_message() {
    let app = build_router(AppState::new(Arc::new(FakeOrchestrator {
        fail: true,
        ..FakeOrchestrator::default()
    })));

    let response = app
        .oneshot(multipart_request(
            "/edit-image/",
            vec![
                Part::File("image", "photo.png", sample_png()),
                Part::Text("prompt", "replace car with bus"),
            ],
        ))
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error_kind"], json!("provider"));
    assert!(body["error"]
        .as_str()
        .expect("error should be a string")
        .contains("space is sleeping"));
}
