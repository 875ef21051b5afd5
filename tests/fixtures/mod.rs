//! Generated test images and job descriptors
#![allow(dead_code)]

use std::io::Cursor;

use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_pipeline::models::job::JobDescriptor;

/// Test image with expected pipeline behavior
#[derive(Debug, Clone)]
pub struct TestImageFixture {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    /// Dimensions after `resize`
    pub resized: (u32, u32),
}

pub const TEST_IMAGES: &[TestImageFixture] = &[
    TestImageFixture {
        name: "landscape.png",
        width: 1200,
        height: 900,
        format: ImageFormat::Png,
        resized: (800, 600),
    },
    TestImageFixture {
        name: "portrait.jpg",
        width: 300,
        height: 1200,
        format: ImageFormat::Jpeg,
        resized: (150, 600),
    },
    TestImageFixture {
        name: "thumbnail.jpg",
        width: 64,
        height: 48,
        format: ImageFormat::Jpeg,
        resized: (64, 48),
    },
];

impl TestImageFixture {
    pub fn bytes(&self) -> Vec<u8> {
        encode(self.width, self.height, self.format)
    }

    pub fn mime(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Gradient image encoded as `format`.
pub fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, format)
        .expect("encode test image");
    out.into_inner()
}

pub fn descriptor(job_id: &str, operations: &[&str]) -> JobDescriptor {
    JobDescriptor {
        job_id: job_id.to_string(),
        file_name: format!("{job_id}_photo.jpg"),
        original_name: "photo.jpg".to_string(),
        operations: operations.iter().map(|s| s.to_string()).collect(),
        timestamp: Utc::now(),
        bucket: "images".to_string(),
    }
}
