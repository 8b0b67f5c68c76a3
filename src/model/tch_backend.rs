use std::{fs, path::Path};

use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tracing::info;

use crate::{
    error::ServiceError,
    model::{ImageFeatures, LogitsModel},
};

const IMAGE_SIDE: i64 = 256;

/// A traced forward pass: `[1, seq]` int64 ids (plus `[1, 3, H, W]` pixels
/// for vision modules) to `[1, seq, vocab]` logits.
pub struct TorchScriptModel {
    module: CModule,
    device: Device,
    accepts_images: bool,
}

impl TorchScriptModel {
    pub fn load(path: &Path, device: &str, accepts_images: bool) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                path.display()
            )));
        }
        let size_bytes = fs::metadata(path)?.len();
        let device = parse_device(device);
        let mut module = CModule::load_on_device(path, device)
            .map_err(|e| ServiceError::Other(e.to_string()))?;
        module.set_eval();
        info!(path = %path.display(), size_bytes, ?device, "torchscript module loaded");

        Ok(Self {
            module,
            device,
            accepts_images,
        })
    }
}

impl LogitsModel for TorchScriptModel {
    fn next_token_logits(
        &mut self,
        context: &[u32],
        image: Option<&ImageFeatures>,
    ) -> Result<Vec<f32>, ServiceError> {
        let ids: Vec<i64> = context.iter().map(|&id| id as i64).collect();

        no_grad(|| {
            let input = Tensor::from_slice(&ids)
                .reshape([1, ids.len() as i64])
                .to(self.device);
            let mut inputs = vec![IValue::Tensor(input)];
            if let Some(features) = image {
                let pixels = Tensor::from_slice(&features.pixels)
                    .reshape(features.shape.as_slice())
                    .to(self.device);
                inputs.push(IValue::Tensor(pixels));
            }

            let output = self
                .module
                .forward_is(&inputs)
                .map_err(|e| ServiceError::Generation(e.to_string()))?;

            // Traced causal LMs return either the logits or a (logits, past) tuple.
            let logits = match output {
                IValue::Tensor(t) => t,
                IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                    IValue::Tensor(t) => t.shallow_clone(),
                    _ => {
                        return Err(ServiceError::Generation(
                            "expected tensor as first tuple element".into(),
                        ));
                    }
                },
                _ => {
                    return Err(ServiceError::Generation(
                        "unexpected model output format".into(),
                    ));
                }
            };

            let last = logits
                .select(1, -1)
                .squeeze()
                .to_kind(Kind::Float)
                .to(Device::Cpu);
            Vec::<f32>::try_from(&last).map_err(|e| ServiceError::Generation(e.to_string()))
        })
    }

    fn encode_image(&mut self, path: &Path) -> Result<ImageFeatures, ServiceError> {
        if !self.accepts_images {
            return Err(ServiceError::validation("model cannot condition on images"));
        }
        let image = tch::vision::image::load_and_resize(path, IMAGE_SIDE, IMAGE_SIDE)
            .map_err(|e| {
                ServiceError::validation(format!("unreadable image {}: {e}", path.display()))
            })?;
        let scaled = image.to_kind(Kind::Float) / 255.0;
        let pixels = Vec::<f32>::try_from(&scaled.flatten(0, -1))
            .map_err(|e| ServiceError::Generation(e.to_string()))?;

        Ok(ImageFeatures {
            shape: vec![1, 3, IMAGE_SIDE, IMAGE_SIDE],
            pixels,
        })
    }

    fn device(&self) -> String {
        match self.device {
            Device::Cuda(idx) => format!("cuda:{idx}"),
            _ => "cpu".to_string(),
        }
    }
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
