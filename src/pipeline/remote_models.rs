//! Inpainting and refinement served by Gradio Spaces. Each load opens a new
//! session; releasing it drops the connection pool.

use std::time::Duration;

use image::DynamicImage;
use serde_json::{json, Value};

use crate::pipeline::gradio::{GradioClient, GradioError};
use crate::pipeline::image_io::{decode_rgb, encode_png};
use crate::pipeline::inpaint::{
    InpaintError, InpaintModel, InpaintRequest, LoadedModel, ModelProvider, RefinerModel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModelEndpoint {
    pub space: String,
    pub api_name: String,
}

#[derive(Debug, Clone)]
pub struct RemoteModelProvider {
    inpaint: RemoteModelEndpoint,
    refiner: RemoteModelEndpoint,
    token: Option<String>,
    timeout: Duration,
}

impl RemoteModelProvider {
    pub fn new(
        inpaint: RemoteModelEndpoint,
        refiner: RemoteModelEndpoint,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inpaint,
            refiner,
            token,
            timeout,
        }
    }

    fn open(&self, endpoint: &RemoteModelEndpoint, model: &str) -> Result<RemoteSession, InpaintError> {
        let client = GradioClient::connect(endpoint.space.as_str(), self.token.clone(), self.timeout)
            .map_err(|e| InpaintError::Load {
                model: model.to_string(),
                message: e.to_string(),
            })?;
        Ok(RemoteSession {
            label: format!("{model} ({})", endpoint.space),
            model: model.to_string(),
            api_name: endpoint.api_name.clone(),
            client: Some(client),
        })
    }
}

impl ModelProvider for RemoteModelProvider {
    fn load_inpainter(&self) -> Result<Box<dyn InpaintModel>, InpaintError> {
        Ok(Box::new(self.open(&self.inpaint, "inpainter")?))
    }

    fn load_refiner(&self) -> Result<Box<dyn RefinerModel>, InpaintError> {
        Ok(Box::new(self.open(&self.refiner, "refiner")?))
    }
}

struct RemoteSession {
    label: String,
    model: String,
    api_name: String,
    client: Option<GradioClient>,
}

impl RemoteSession {
    fn client(&self) -> Result<&GradioClient, InpaintError> {
        self.client.as_ref().ok_or_else(|| InpaintError::Inference {
            model: self.model.clone(),
            message: String::from("session already released"),
        })
    }

    fn inference_error(&self, message: impl ToString) -> InpaintError {
        InpaintError::Inference {
            model: self.model.clone(),
            message: message.to_string(),
        }
    }

    fn upload(&self, image: &DynamicImage, file_name: &str) -> Result<Value, InpaintError> {
        let bytes = encode_png(image).map_err(|e| self.inference_error(e))?;
        self.client()?
            .upload_png(bytes, file_name)
            .map_err(|e| self.inference_error(e))
    }

    fn call_for_image(&self, data: Vec<Value>) -> Result<DynamicImage, InpaintError> {
        let client = self.client()?;
        let outputs = client
            .predict(self.api_name.as_str(), data)
            .map_err(|e| self.inference_error(e))?;
        let first = outputs.first().ok_or_else(|| {
            self.inference_error(GradioError::UnexpectedOutput(String::from("no outputs")))
        })?;
        let bytes = client
            .download_file(first)
            .map_err(|e| self.inference_error(e))?;
        decode_rgb(bytes.as_slice()).map_err(|e| self.inference_error(e))
    }
}

impl LoadedModel for RemoteSession {
    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn release(&mut self) {
        self.client = None;
    }
}

impl InpaintModel for RemoteSession {
    fn inpaint(&self, request: &InpaintRequest<'_>) -> Result<DynamicImage, InpaintError> {
        let image_ref = self.upload(request.image, "image.png")?;
        let mask_ref = self.upload(&DynamicImage::ImageLuma8(request.mask.clone()), "mask.png")?;
        self.call_for_image(vec![
            image_ref,
            mask_ref,
            Value::String(request.prompt.to_string()),
            json!(request.strength),
        ])
    }
}

impl RefinerModel for RemoteSession {
    fn refine(&self, prompt: &str, image: &DynamicImage) -> Result<DynamicImage, InpaintError> {
        let image_ref = self.upload(image, "image.png")?;
        self.call_for_image(vec![image_ref, Value::String(prompt.to_string())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::inpaint::ModelLease;

    fn provider(space: &str) -> RemoteModelProvider {
        RemoteModelProvider::new(
            RemoteModelEndpoint {
                space: space.to_string(),
                api_name: String::from("/inpaint_with_mask"),
            },
            RemoteModelEndpoint {
                space: space.to_string(),
                api_name: String::from("/refine"),
            },
            None,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn invalid_space_fails_at_load() {
        let err = provider("not-a-space")
            .load_inpainter()
            .err()
            .expect("load should fail");
        assert!(matches!(err, InpaintError::Load { .. }));
    }

    #[test]
    fn released_session_refuses_inference() {
        let lease = ModelLease::new(
            provider("IotaCluster/Inpaint_Refine")
                .load_refiner()
                .expect("load should not touch the network"),
        );
        assert!(lease.label().contains("IotaCluster/Inpaint_Refine"));

        let mut session = RemoteSession {
            label: String::from("refiner"),
            model: String::from("refiner"),
            api_name: String::from("/refine"),
            client: None,
        };
        session.release();
        let err = session
            .refine("bus", &DynamicImage::new_rgb8(2, 2))
            .expect_err("released session should fail");
        assert!(err.to_string().contains("released"));
    }
}
