//! Shared test fixtures: small on-disk image trees and tiny model configs.

use std::path::Path;

use image::{Rgb, RgbImage};

/// Create `root/<class>/<nnn>.png` files, `count` per class
///
/// Each class gets a distinct base colour so tiny models can separate them.
pub fn write_class_tree(root: &Path, classes: &[(&str, usize)]) {
    for (class_idx, (name, count)) in classes.iter().enumerate() {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..*count {
            let shade = (40 + 100 * (class_idx % 3)) as u8;
            let img = RgbImage::from_fn(12, 12, |x, y| {
                Rgb([shade, (x * 10) as u8, (y * 10 + i as u32) as u8])
            });
            img.save(dir.join(format!("{:03}.png", i))).unwrap();
        }
    }
}

/// Write a file with an image extension that cannot be decoded
pub fn write_corrupt_image(path: &Path) {
    std::fs::write(path, b"definitely not a png").unwrap();
}
