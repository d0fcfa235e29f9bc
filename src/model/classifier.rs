//! The full model: one backbone adapter feeding one classification head.

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Int, Tensor},
};

use crate::model::backbone::BackboneAdapter;
use crate::model::descriptor::{BackboneConfig, WeightsSource};
use crate::model::head::{ClassificationHead, HeadConfig};

/// Everything needed to rebuild a [`SorghumClassifier`]
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub backbone: BackboneConfig,

    /// Number of cultivars, taken from the training vocabulary
    pub num_classes: usize,

    /// Hidden width of the head funnel, `None` for a single linear layer
    pub hidden_size: Option<usize>,

    #[config(default = "0.5")]
    pub dropout: f64,
}

impl ClassifierConfig {
    pub fn head_config(&self) -> HeadConfig {
        HeadConfig::new(self.backbone.kind.feature_width(), self.num_classes)
            .with_hidden_size(self.hidden_size)
            .with_dropout(self.dropout)
    }

    pub fn validate(&self) -> crate::utils::error::Result<()> {
        self.backbone.validate()?;
        self.head_config().validate()
    }

    /// Build the model, loading pretrained backbone weights and applying the
    /// freeze policy
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::utils::error::Result<SorghumClassifier<B>> {
        self.validate()?;

        let backbone = BackboneAdapter::new(&self.backbone, device)?;
        let head = self.head_config().init(device)?;

        tracing::info!(
            "Built classifier: {} ({}px, {} features) -> {} classes{}",
            backbone.kind(),
            backbone.expected_input_size(),
            backbone.output_width(),
            self.num_classes,
            if self.backbone.freeze { ", backbone frozen" } else { "" }
        );

        Ok(SorghumClassifier { backbone, head })
    }

    /// Same architecture with random parameters, no weight file and no
    /// freezing; used as the target of a checkpoint load
    pub fn init_untrained<B: Backend>(&self, device: &B::Device) -> crate::utils::error::Result<SorghumClassifier<B>> {
        let bare = BackboneConfig {
            weights: WeightsSource::None,
            freeze: false,
            ..self.backbone.clone()
        };
        bare.validate()?;

        let descriptor = bare.descriptor();
        Ok(SorghumClassifier {
            backbone: BackboneAdapter::untrained(
                descriptor.kind,
                descriptor.expected_input_size,
                device,
            ),
            head: self.head_config().init(device)?,
        })
    }
}

/// Sorghum cultivar classifier
#[derive(Module, Debug)]
pub struct SorghumClassifier<B: Backend> {
    backbone: BackboneAdapter<B>,
    head: ClassificationHead<B>,
}

impl<B: Backend> SorghumClassifier<B> {
    /// `[batch, 3, S, S]` -> logits `[batch, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> crate::utils::error::Result<Tensor<B, 2>> {
        let features = self.backbone.extract_features(images)?;
        Ok(self.head.forward(features))
    }

    /// Index of the highest logit per sample
    pub fn predict(&self, images: Tensor<B, 4>) -> crate::utils::error::Result<Tensor<B, 1, Int>> {
        let logits = self.forward(images)?;
        let [batch, _] = logits.dims();
        Ok(logits.argmax(1).reshape([batch]))
    }

    pub fn expected_input_size(&self) -> usize {
        self.backbone.expected_input_size()
    }

    pub fn backbone(&self) -> &BackboneAdapter<B> {
        &self.backbone
    }

    /// Freeze the backbone when `freeze` is set
    pub fn apply_freeze(self, freeze: bool) -> Self {
        if !freeze {
            return self;
        }
        Self {
            backbone: self.backbone.freeze(),
            head: self.head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::BackboneKind;
    use crate::utils::error::SorghumError;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_config(hidden_size: Option<usize>) -> ClassifierConfig {
        ClassifierConfig::new(
            BackboneConfig::new(BackboneKind::EfficientnetB0).with_input_size(Some(32)),
            5,
        )
        .with_hidden_size(hidden_size)
    }

    #[test]
    fn test_forward_produces_logits_per_class() {
        let device = Default::default();
        for hidden in [None, Some(64)] {
            let model = small_config(hidden).init::<TestBackend>(&device).unwrap();
            assert_eq!(model.expected_input_size(), 32);

            let logits = model.forward(Tensor::zeros([2, 3, 32, 32], &device)).unwrap();
            assert_eq!(logits.dims(), [2, 5]);

            let predicted = model.predict(Tensor::zeros([2, 3, 32, 32], &device)).unwrap();
            assert_eq!(predicted.dims(), [2]);
        }
    }

    #[test]
    fn test_forward_rejects_wrong_size() {
        let device = Default::default();
        let model = small_config(None).init::<TestBackend>(&device).unwrap();
        let result = model.forward(Tensor::zeros([1, 3, 48, 48], &device));
        assert!(matches!(result, Err(SorghumError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_building() {
        let device = Default::default();
        let config = small_config(Some(2));
        assert!(config.init::<TestBackend>(&device).is_err());

        let tiny = ClassifierConfig::new(
            BackboneConfig::new(BackboneKind::Xception).with_input_size(Some(16)),
            5,
        );
        assert!(tiny.init_untrained::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_config_json_roundtrip_keeps_architecture() {
        let config = small_config(Some(64)).with_dropout(0.25);
        let json = serde_json::to_string(&config).unwrap();
        let restored: ClassifierConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.backbone.kind, BackboneKind::EfficientnetB0);
        assert_eq!(restored.backbone.input_size, Some(32));
        assert_eq!(restored.hidden_size, Some(64));
        assert_eq!(restored.dropout, 0.25);
    }
}
