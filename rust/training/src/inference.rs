use std::path::Path;

use burn::{prelude::*, tensor::activation::softmax};
use rand::{SeedableRng, rngs::StdRng};
use resnet_core::{ResNet, resnet::ResNetRecord};
use resnet_data::{ImageTransform, Split, load_classes};

use crate::{
    checkpoint::{CheckpointPaths, CheckpointSelector, load_record},
    error::TrainingError,
    training::{CLASSES_FILE, CONFIG_FILE, ResNetTrainingConfig, build_model},
};

/// One ranked class for an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub class: String,
    pub probability: f32,
}

pub struct ResNetClassifier<B: Backend> {
    model: ResNet<B>,
    transform: ImageTransform,
    classes: Vec<String>,
    device: B::Device,
}

impl<B: Backend> ResNetClassifier<B> {
    /// Load the averaged weights of `checkpoint` from an artifact directory.
    pub fn load_from_artifacts(
        artifact_dir: &Path,
        checkpoint: CheckpointSelector,
        device: B::Device,
    ) -> Result<Self, TrainingError> {
        let config_path = artifact_dir.join(CONFIG_FILE);
        let config = ResNetTrainingConfig::load(&config_path)
            .map_err(|e| TrainingError::Io(config_path.display().to_string(), e))?;
        let classes = load_classes(artifact_dir.join(CLASSES_FILE))?;

        let paths = CheckpointPaths::select(artifact_dir, checkpoint);
        let record = load_record::<B, ResNetRecord<B>>(&paths.ema, &device)?;
        let model = build_model::<B>(&config.params.model, &device).load_record(record);

        let transform = ImageTransform::from_config(&config.params.data, Split::Test)?;
        Ok(Self::new(model, transform, classes, device))
    }

    pub fn new(
        model: ResNet<B>,
        transform: ImageTransform,
        classes: Vec<String>,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            transform,
            classes,
            device,
        }
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// The `top_k` most likely classes for the image at `path`, most likely first.
    pub fn classify(&self, path: &Path, top_k: usize) -> Result<Vec<Prediction>, TrainingError> {
        // the evaluation pipeline draws no random numbers
        let mut rng = StdRng::seed_from_u64(0);
        let pixels = self.transform.load(path, &mut rng)?;
        let size = self.transform.image_size as usize;
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [1, 3, size, size]),
            &self.device,
        );
        Ok(self.rank(images, top_k))
    }

    fn rank(&self, images: Tensor<B, 4>, top_k: usize) -> Vec<Prediction> {
        let probs = softmax(self.model.forward(images), 1);
        let k = top_k.clamp(1, self.model.num_classes());
        let (values, indices) = probs.topk_with_indices(k, 1);

        let values = values.into_data().iter::<f32>().collect::<Vec<_>>();
        let indices = indices.into_data().iter::<i64>().collect::<Vec<_>>();

        values
            .into_iter()
            .zip(indices)
            .map(|(probability, label)| {
                let label = label as usize;
                Prediction {
                    label,
                    class: self
                        .classes
                        .get(label)
                        .cloned()
                        .unwrap_or_else(|| label.to_string()),
                    probability,
                }
            })
            .collect()
    }
}

/// Classify one image with the best checkpoint of `artifact_dir`.
pub fn classify<B: Backend>(
    device: &B::Device,
    artifact_dir: &Path,
    image: &Path,
    top_k: usize,
) -> Result<Vec<Prediction>, TrainingError> {
    let classifier = ResNetClassifier::<B>::load_from_artifacts(
        artifact_dir,
        CheckpointSelector::Best,
        device.clone(),
    )?;
    classifier.classify(image, top_k)
}

#[cfg(test)]
mod tests {
    use resnet_core::test_utils::{TestBackend, test_device, tiny_model};
    use resnet_data::{Normalize, test_utils::write_image};

    use super::*;

    fn classifier(classes: &[&str]) -> ResNetClassifier<TestBackend> {
        ResNetClassifier::new(
            tiny_model(classes.len()),
            ImageTransform::new(Split::Test, 16, 18, Normalize::default()),
            classes.iter().map(ToString::to_string).collect(),
            test_device(),
        )
    }

    #[test]
    fn test_predictions_are_ranked_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x.png");
        write_image(&image, 30, 24);

        let predictions = classifier(&["a", "b", "c", "d"]).classify(&image, 3).unwrap();
        assert_eq!(predictions.len(), 3);
        assert!(predictions.windows(2).all(|w| w[0].probability >= w[1].probability));
        assert!(predictions.iter().all(|p| (0.0..=1.0).contains(&p.probability)));
        for p in &predictions {
            assert_eq!(p.class, ["a", "b", "c", "d"][p.label]);
        }
    }

    #[test]
    fn test_top_k_is_clamped_to_classes() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x.png");
        write_image(&image, 16, 16);

        let predictions = classifier(&["a", "b"]).classify(&image, 10).unwrap();
        assert_eq!(predictions.len(), 2);
        let total: f32 = predictions.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_image_is_error() {
        let result = classifier(&["a"]).classify(Path::new("/nonexistent/x.png"), 1);
        assert!(matches!(result, Err(TrainingError::Data(_))));
    }
}
