use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::Dataset,
    },
    prelude::*,
};
use rand::{RngExt, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use crate::{dataset::ImageItem, transform::ImageTransform};

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// `[batch, 3, size, size]`
    pub images: Tensor<B, 4>,
    /// `[batch]` class indices.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatch<B> {
    pub fn new(images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> Self {
        Self { images, targets }
    }

    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes and transforms the items of a batch in parallel.
///
/// Every item draws from its own generator seeded from `(seed, batch counter,
/// position)`, so a fixed seed reproduces the augmentations of a fixed item order.
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    transform: ImageTransform,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl ImageBatcher {
    #[must_use]
    pub fn new(transform: ImageTransform, seed: Option<u64>) -> Self {
        Self {
            transform,
            seed: seed.unwrap_or_else(|| rand::rng().random()),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn transform(&self) -> &ImageTransform {
        &self.transform
    }
}

impl<B: Backend> Batcher<B, ImageItem, ClassificationBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ClassificationBatch<B> {
        let size = self.transform.image_size as usize;
        let batch_seed = self
            .seed
            .wrapping_add(self.counter.fetch_add(1, Ordering::Relaxed).wrapping_mul(1 << 32));

        let decoded: Vec<(Vec<f32>, i64)> = items
            .par_iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let mut rng = StdRng::seed_from_u64(batch_seed.wrapping_add(i as u64));
                match self.transform.load(&item.path, &mut rng) {
                    Ok(pixels) => Some((pixels, item.label as i64)),
                    Err(e) => {
                        tracing::warn!("skipping image: {e}");
                        None
                    }
                }
            })
            .collect();

        let count = decoded.len();
        let mut pixels = Vec::with_capacity(count * self.transform.output_len());
        let mut labels = Vec::with_capacity(count);
        for (image, label) in decoded {
            pixels.extend(image);
            labels.push(label);
        }

        let images = Tensor::from_data(TensorData::new(pixels, [count, 3, size, size]), device);
        let targets = Tensor::from_data(TensorData::new(labels, [count]), device);

        ClassificationBatch::new(images, targets)
    }
}

/// Loader over `dataset`. Shuffled with `shuffle_seed` when given, in order otherwise.
/// Zero workers batches on the calling thread.
pub fn image_loader<B: Backend, D: Dataset<ImageItem> + 'static>(
    dataset: D,
    batcher: ImageBatcher,
    batch_size: usize,
    num_workers: usize,
    shuffle_seed: Option<u64>,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, ClassificationBatch<B>>> {
    let mut builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .set_device(device.clone());
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }

    match shuffle_seed {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}
