//! Backbone adapter: interchangeable convolutional feature extractors behind
//! one interface.
//!
//! Every variant drops its ImageNet classifier and returns globally pooled
//! penultimate activations of shape `[batch, output_width]`.

pub mod blocks;
pub mod efficientnet;
pub mod resnest;
pub mod xception;

use std::path::Path;

use burn::{
    module::{Ignored, Module},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};

use crate::model::descriptor::{BackboneConfig, BackboneDescriptor, BackboneKind, WeightsSource};
use crate::utils::error::{Result, SorghumError};

pub use efficientnet::{EfficientNet, EfficientNetVariant};
pub use resnest::ResNeSt;
pub use xception::Xception;

/// Maps an image batch to pooled feature vectors
pub trait FeatureExtractor<B: Backend> {
    /// `[batch, 3, S, S]` -> `[batch, feature_width]`
    fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2>;

    fn feature_width(&self) -> usize;
}

/// Concrete backbone networks
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Xception(Xception<B>),
    EfficientNet(EfficientNet<B>),
    ResNeSt(ResNeSt<B>),
}

impl<B: Backend> Backbone<B> {
    /// Randomly initialized network for `kind`
    pub fn new(kind: BackboneKind, device: &B::Device) -> Self {
        match kind.efficientnet_variant() {
            Some(variant) => Backbone::EfficientNet(EfficientNet::new(variant, device)),
            None if kind == BackboneKind::Resnest50 => Backbone::ResNeSt(ResNeSt::new(device)),
            None => Backbone::Xception(Xception::new(device)),
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for Backbone<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::Xception(net) => net.forward_features(input),
            Backbone::EfficientNet(net) => net.forward_features(input),
            Backbone::ResNeSt(net) => net.forward_features(input),
        }
    }

    fn feature_width(&self) -> usize {
        match self {
            Backbone::Xception(net) => net.feature_width(),
            Backbone::EfficientNet(net) => net.feature_width(),
            Backbone::ResNeSt(net) => net.feature_width(),
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// A backbone plus the metadata callers need to feed it
#[derive(Module, Debug)]
pub struct BackboneAdapter<B: Backend> {
    backbone: Backbone<B>,
    kind: Ignored<BackboneKind>,
    input_size: usize,
}

impl<B: Backend> BackboneAdapter<B> {
    /// Build the network, load pretrained weights if configured, then apply
    /// the freeze policy
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let descriptor = config.descriptor();

        let mut adapter = Self::untrained(descriptor.kind, descriptor.expected_input_size, device);

        if let WeightsSource::File(path) = &descriptor.weights {
            adapter = adapter.load_weights(path, device)?;
            tracing::info!("Loaded {} weights from {}", descriptor.kind, path.display());
        }

        if config.freeze {
            adapter = adapter.freeze();
        }

        Ok(adapter)
    }

    /// Randomly initialized adapter, no weights and no freezing
    pub fn untrained(kind: BackboneKind, input_size: usize, device: &B::Device) -> Self {
        Self {
            backbone: Backbone::new(kind, device),
            kind: Ignored(kind),
            input_size,
        }
    }

    /// Replace the backbone parameters with a record saved by [`Self::save_weights`]
    pub fn load_weights(self, path: &Path, device: &B::Device) -> Result<Self> {
        let load_error = |e: burn::record::RecorderError| SorghumError::BackboneLoad {
            backbone: self.kind.0.to_string(),
            reason: format!("{}: {:?}", path.display(), e),
        };

        let backbone = match self.backbone {
            Backbone::Xception(net) => {
                Backbone::Xception(net.load_file(path, &recorder(), device).map_err(load_error)?)
            }
            Backbone::EfficientNet(net) => Backbone::EfficientNet(
                net.load_file(path, &recorder(), device)
                    .map_err(load_error)?,
            ),
            Backbone::ResNeSt(net) => {
                Backbone::ResNeSt(net.load_file(path, &recorder(), device).map_err(load_error)?)
            }
        };

        Ok(Self { backbone, ..self })
    }

    /// Save the backbone parameters alone, loadable as `WeightsSource::File`
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        let save_error = |e: burn::record::RecorderError| {
            SorghumError::Checkpoint(format!("failed to save backbone weights: {:?}", e))
        };

        match &self.backbone {
            Backbone::Xception(net) => net.clone().save_file(path, &recorder()),
            Backbone::EfficientNet(net) => net.clone().save_file(path, &recorder()),
            Backbone::ResNeSt(net) => net.clone().save_file(path, &recorder()),
        }
        .map_err(save_error)
    }

    /// Stop gradient tracking on every backbone parameter
    pub fn freeze(self) -> Self {
        Self {
            backbone: self.backbone.no_grad(),
            ..self
        }
    }

    /// Pooled features for a `[batch, 3, S, S]` batch; never resizes
    pub fn extract_features(&self, batch: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let dims = batch.dims();
        let [_, channels, height, width] = dims;
        if channels != 3 || height != self.input_size || width != self.input_size {
            return Err(SorghumError::ShapeMismatch {
                backbone: self.kind.0.to_string(),
                expected: self.input_size,
                actual: dims,
            });
        }

        Ok(self.backbone.forward_features(batch))
    }

    pub fn kind(&self) -> BackboneKind {
        self.kind.0
    }

    pub fn expected_input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_width(&self) -> usize {
        self.backbone.feature_width()
    }

    pub fn descriptor(&self) -> BackboneDescriptor {
        BackboneDescriptor {
            kind: self.kind.0,
            expected_input_size: self.input_size,
            output_width: self.output_width(),
            weights: WeightsSource::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::AutodiffModule;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::tempdir;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    const SIZE: usize = 32;

    fn config(kind: BackboneKind) -> BackboneConfig {
        BackboneConfig::new(kind).with_input_size(Some(SIZE))
    }

    #[test]
    fn test_each_backbone_extracts_its_feature_width() {
        let device = Default::default();
        for kind in [
            BackboneKind::Xception,
            BackboneKind::EfficientnetB3,
            BackboneKind::Resnest50,
        ] {
            let adapter = BackboneAdapter::<TestBackend>::new(&config(kind), &device).unwrap();
            assert_eq!(adapter.expected_input_size(), SIZE);
            assert_eq!(adapter.output_width(), kind.feature_width());

            let features = adapter
                .extract_features(Tensor::zeros([2, 3, SIZE, SIZE], &device))
                .unwrap();
            assert_eq!(features.dims(), [2, kind.feature_width()]);
        }
    }

    #[test]
    fn test_odd_input_sizes_run_end_to_end() {
        let device = Default::default();
        for (kind, size) in [
            (BackboneKind::Xception, 45),
            (BackboneKind::EfficientnetB0, 45),
            (BackboneKind::Resnest50, 45),
            (BackboneKind::Resnest50, 100),
        ] {
            let adapter = BackboneAdapter::<TestBackend>::untrained(kind, size, &device);
            let features = adapter
                .extract_features(Tensor::zeros([1, 3, size, size], &device))
                .unwrap();
            assert_eq!(features.dims(), [1, kind.feature_width()]);
        }
    }

    #[test]
    fn test_wrong_spatial_size_is_rejected() {
        let device = Default::default();
        let adapter =
            BackboneAdapter::<TestBackend>::untrained(BackboneKind::EfficientnetB0, SIZE, &device);

        let err = adapter
            .extract_features(Tensor::zeros([1, 3, SIZE + 8, SIZE + 8], &device))
            .unwrap_err();
        match err {
            SorghumError::ShapeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, SIZE);
                assert_eq!(actual, [1, 3, SIZE + 8, SIZE + 8]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }

        let wrong_channels = adapter.extract_features(Tensor::zeros([1, 1, SIZE, SIZE], &device));
        assert!(matches!(wrong_channels, Err(SorghumError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_missing_weights_file() {
        let device = Default::default();
        let config = config(BackboneKind::EfficientnetB0)
            .with_weights(WeightsSource::File("/nonexistent/efficientnet_b0.mpk".into()));

        let err = BackboneAdapter::<TestBackend>::new(&config, &device).unwrap_err();
        assert!(matches!(err, SorghumError::BackboneLoad { .. }));
    }

    #[test]
    fn test_corrupt_weights_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.mpk");
        std::fs::write(&path, b"definitely not messagepack").unwrap();

        let device = Default::default();
        let config = config(BackboneKind::EfficientnetB0).with_weights(WeightsSource::File(path));
        let err = BackboneAdapter::<TestBackend>::new(&config, &device).unwrap_err();
        assert!(matches!(err, SorghumError::BackboneLoad { .. }));
    }

    #[test]
    fn test_saved_weights_reload_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("efficientnet_b0.mpk");
        let device = Default::default();

        let source =
            BackboneAdapter::<TestBackend>::untrained(BackboneKind::EfficientnetB0, SIZE, &device);
        source.save_weights(&path).unwrap();

        let config = config(BackboneKind::EfficientnetB0).with_weights(WeightsSource::File(path));
        let loaded = BackboneAdapter::<TestBackend>::new(&config, &device).unwrap();

        let input = Tensor::<TestBackend, 4>::ones([1, 3, SIZE, SIZE], &device);
        let expected = source.extract_features(input.clone()).unwrap();
        let actual = loaded.extract_features(input).unwrap();
        expected.into_data().assert_approx_eq(&actual.into_data(), burn::tensor::Tolerance::<f32>::absolute(1e-5));
    }

    #[test]
    fn test_freeze_stops_gradients() {
        let device = Default::default();
        let frozen = BackboneAdapter::<TestAutodiffBackend>::new(
            &config(BackboneKind::EfficientnetB0).with_freeze(true),
            &device,
        )
        .unwrap();

        let features = frozen
            .extract_features(Tensor::ones([1, 3, SIZE, SIZE], &device))
            .unwrap();
        assert!(!features.is_require_grad());

        let trainable = BackboneAdapter::<TestAutodiffBackend>::new(
            &config(BackboneKind::EfficientnetB0),
            &device,
        )
        .unwrap();
        let features = trainable
            .extract_features(Tensor::ones([1, 3, SIZE, SIZE], &device))
            .unwrap();
        assert!(features.is_require_grad());

        // the inference copy keeps the same metadata
        assert_eq!(trainable.valid().expected_input_size(), SIZE);
    }
}
