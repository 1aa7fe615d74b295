//! Helpers for tests that need image folders on disk.

use std::path::Path;

use image::{Rgb, RgbImage};

/// Write a colour-gradient PNG (or whatever `path`'s extension selects), creating parent dirs.
pub fn write_image(path: &Path, width: u32, height: u32) {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    });
    save(path, &image);
}

pub fn write_solid_image(path: &Path, width: u32, height: u32, colour: [u8; 3]) {
    save(path, &RgbImage::from_pixel(width, height, Rgb(colour)));
}

/// Build `root/<class>/<i>.png` with `per_class` images for every class.
pub fn write_image_folder(root: &Path, classes: &[&str], per_class: usize, size: u32) {
    for class in classes {
        for i in 0..per_class {
            write_image(&root.join(class).join(format!("{i}.png")), size, size);
        }
    }
}

fn save(path: &Path, image: &RgbImage) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create image directory");
    }
    image.save(path).expect("write test image");
}
