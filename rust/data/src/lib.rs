//! ResNet Data - Image loading and augmentation
//!
//! This crate provides:
//! - `ImageFolder` - Dataset over a `root/<class>/<image>` directory tree
//! - `ImageTransform` - Training augmentation and evaluation preprocessing
//! - `ImageBatcher` - Parallel decoding into `ClassificationBatch`

pub mod batcher;
pub mod dataset;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transform;

// Re-export commonly used items
pub use batcher::{ClassificationBatch, ImageBatcher, image_loader};
pub use dataset::{
    DataError, IMAGE_EXTENSIONS, ImageFolder, ImageItem, Split, load_classes, save_classes,
};
pub use transform::{ImageTransform, Normalize};
