use burn::module::{Module, Param, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageNetConfig {
    pub n_classes: usize,
    pub in_channels: usize,
    pub input_size: usize,
    pub base_filters: usize,
    pub semantic_filters: usize,
    pub semantic: bool,
}

impl Default for TriageNetConfig {
    fn default() -> Self {
        Self {
            n_classes: 2,
            in_channels: 3,
            input_size: 480,
            base_filters: 16,
            semantic_filters: 8,
            semantic: true,
        }
    }
}

impl TriageNetConfig {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.n_classes > 1, "n_classes must be > 1"),
            (self.in_channels > 0, "in_channels must be > 0"),
            (self.input_size > 1, "input_size must be > 1"),
            (self.base_filters > 0, "base_filters must be > 0"),
            (!self.semantic || self.semantic_filters > 0, "semantic_filters must be > 0"),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(TriageError::InvalidConfig(message.to_string()));
            }
        }
        Ok(())
    }

    pub fn feature_dim(&self) -> usize {
        self.base_filters * 2
    }
}

impl fmt::Display for TriageNetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A trainable parameter addressed by its hierarchical name.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlot {
    pub name: String,
    pub id: ParamId,
    pub shape: Vec<usize>,
}

impl ParamSlot {
    fn of<B: Backend, const D: usize>(name: String, param: &Param<Tensor<B, D>>) -> Self {
        Self {
            name,
            id: param.id,
            shape: param.val().dims().to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

fn conv_slots<B: Backend>(prefix: &str, conv: &Conv2d<B>, slots: &mut Vec<ParamSlot>) {
    slots.push(ParamSlot::of(format!("{prefix}/weight"), &conv.weight));
    if let Some(bias) = &conv.bias {
        slots.push(ParamSlot::of(format!("{prefix}/bias"), bias));
    }
}

fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

/// Small convolutional branch producing a one-channel attention mask.
#[derive(Module, Debug)]
pub struct SemanticNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> SemanticNet<B> {
    pub fn new(filters: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3([1, filters], device),
            conv2: conv3x3([filters, 1], device),
        }
    }

    /// `[N, C, H, W]` images to a `[N, 1, H, W]` mask in `(0, 1)`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let gray = images.mean_dim(1);
        let x = relu(self.conv1.forward(gray));
        sigmoid(self.conv2.forward(x))
    }

    fn slots(&self, prefix: &str, slots: &mut Vec<ParamSlot>) {
        conv_slots(&format!("{prefix}/conv1"), &self.conv1, slots);
        conv_slots(&format!("{prefix}/conv2"), &self.conv2, slots);
    }
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    gap: AdaptiveAvgPool2d,
}

impl<B: Backend> Backbone<B> {
    pub fn new(in_channels: usize, filters: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3([in_channels, filters], device),
            conv2: conv3x3([filters, filters * 2], device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.gap.forward(relu(self.conv2.forward(x)));
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    fn slots(&self, prefix: &str, slots: &mut Vec<ParamSlot>) {
        conv_slots(&format!("{prefix}/conv1"), &self.conv1, slots);
        conv_slots(&format!("{prefix}/conv2"), &self.conv2, slots);
    }
}

#[derive(Clone, Debug)]
pub struct TriageOutput<B: Backend> {
    /// Unscaled class scores `[N, n_classes]`.
    pub logits: Tensor<B, 2>,
    /// Softmax of the logits.
    pub prediction: Tensor<B, 2>,
    /// Semantic mask `[N, 1, H, W]` when the branch exists.
    pub semantic: Option<Tensor<B, 4>>,
}

#[derive(Module, Debug)]
pub struct TriageNet<B: Backend> {
    sem: Option<SemanticNet<B>>,
    backbone: Backbone<B>,
    final_output: Linear<B>,
}

impl<B: Backend> TriageNet<B> {
    pub fn new(config: &TriageNetConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let sem = if config.semantic {
            Some(SemanticNet::new(config.semantic_filters, device))
        } else {
            None
        };
        let backbone = Backbone::new(config.in_channels, config.base_filters, device);
        let final_output = LinearConfig::new(config.feature_dim(), config.n_classes).init(device);

        Ok(Self {
            sem,
            backbone,
            final_output,
        })
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> TriageOutput<B> {
        let semantic = self.sem.as_ref().map(|sem| sem.forward(images.clone()));

        let attended = match &semantic {
            Some(mask) => {
                let channels = images.dims()[1];
                images * mask.clone().repeat_dim(1, channels).add_scalar(1.0)
            }
            None => images,
        };

        let logits = self.final_output.forward(self.backbone.forward(attended));
        let prediction = softmax(logits.clone(), 1);

        TriageOutput {
            logits,
            prediction,
            semantic,
        }
    }

    pub fn semantic_mask(&self, images: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        self.sem.as_ref().map(|sem| sem.forward(images))
    }

    pub fn has_semantic(&self) -> bool {
        self.sem.is_some()
    }

    pub fn output_bias(&self) -> Option<Tensor<B, 1>> {
        self.final_output.bias.as_ref().map(|bias| bias.val())
    }

    /// Every trainable parameter with its hierarchical name.
    pub fn parameter_slots(&self) -> Vec<ParamSlot> {
        let mut slots = Vec::new();
        if let Some(sem) = &self.sem {
            sem.slots("sem", &mut slots);
        }
        self.backbone.slots("backbone", &mut slots);
        slots.push(ParamSlot::of(
            "final_output/weight".to_string(),
            &self.final_output.weight,
        ));
        if let Some(bias) = &self.final_output.bias {
            slots.push(ParamSlot::of("final_output/bias".to_string(), bias));
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config(semantic: bool) -> TriageNetConfig {
        TriageNetConfig {
            input_size: 8,
            base_filters: 4,
            semantic_filters: 2,
            semantic,
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = TriageNet::<TestBackend>::new(&small_config(true), &device).unwrap();
        let images = Tensor::<TestBackend, 4>::ones([3, 3, 8, 8], &device);
        let output = model.forward(images);

        assert_eq!(output.logits.dims(), [3, 2]);
        assert_eq!(output.prediction.dims(), [3, 2]);
        assert_eq!(output.semantic.unwrap().dims(), [3, 1, 8, 8]);

        let row_sums = output.prediction.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_parameter_slot_names() {
        let device = Default::default();
        let model = TriageNet::<TestBackend>::new(&small_config(true), &device).unwrap();
        let names: Vec<String> = model.parameter_slots().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "sem/conv1/weight",
                "sem/conv1/bias",
                "sem/conv2/weight",
                "sem/conv2/bias",
                "backbone/conv1/weight",
                "backbone/conv1/bias",
                "backbone/conv2/weight",
                "backbone/conv2/bias",
                "final_output/weight",
                "final_output/bias",
            ]
        );
    }

    #[test]
    fn test_without_semantic_branch() {
        let device = Default::default();
        let model = TriageNet::<TestBackend>::new(&small_config(false), &device).unwrap();
        assert!(!model.has_semantic());
        assert!(model.parameter_slots().iter().all(|s| !s.name.starts_with("sem")));

        let output = model.forward(Tensor::zeros([1, 3, 8, 8], &device));
        assert!(output.semantic.is_none());
    }

    #[test]
    fn test_slot_shapes() {
        let device = Default::default();
        let model = TriageNet::<TestBackend>::new(&small_config(false), &device).unwrap();
        let slots = model.parameter_slots();
        let head = slots.iter().find(|s| s.name == "final_output/weight").unwrap();
        assert_eq!(head.shape, vec![8, 2]);
        assert_eq!(head.rank(), 2);
        let conv = slots.iter().find(|s| s.name == "backbone/conv1/weight").unwrap();
        assert_eq!(conv.shape, vec![4, 3, 3, 3]);
    }

    #[test]
    fn test_invalid_config() {
        let config = TriageNetConfig {
            n_classes: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
