//! 64-bit DCT perceptual hash.
//!
//! Grayscale, downscale to 32x32, 2-D DCT-II, keep the 8x8 lowest frequencies and
//! set one bit per coefficient above their median.

use std::f64::consts::PI;
use std::fmt;

use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

const HASH_SIZE: usize = 8;
const SAMPLE_SIZE: usize = HASH_SIZE * 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PHash(pub u64);

impl PHash {
    pub fn of(image: &RgbImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let gray = image::imageops::grayscale(image);
        let small = image::imageops::resize(
            &gray,
            SAMPLE_SIZE as u32,
            SAMPLE_SIZE as u32,
            FilterType::Lanczos3,
        );
        let mut pixels = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
        for (x, y, p) in small.enumerate_pixels() {
            pixels[y as usize][x as usize] = p.0[0] as f64;
        }

        let coeffs = dct_2d(&pixels);
        let mut low = Vec::with_capacity(HASH_SIZE * HASH_SIZE);
        for row in coeffs.iter().take(HASH_SIZE) {
            low.extend_from_slice(&row[..HASH_SIZE]);
        }
        let median = median(&low);

        let bits = low
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &c)| if c > median { acc | (1 << (63 - i)) } else { acc });
        Some(PHash(bits))
    }

    /// Hamming distance.
    pub fn distance(&self, other: &PHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for PHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn dct_1d(input: &[f64; SAMPLE_SIZE]) -> [f64; SAMPLE_SIZE] {
    let n = SAMPLE_SIZE as f64;
    let mut out = [0f64; SAMPLE_SIZE];
    for (k, slot) in out.iter_mut().enumerate() {
        *slot = input
            .iter()
            .enumerate()
            .map(|(i, &v)| v * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
            .sum::<f64>()
            * 2.0;
    }
    out
}

fn dct_2d(pixels: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let mut columns = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for x in 0..SAMPLE_SIZE {
        let mut column = [0f64; SAMPLE_SIZE];
        for y in 0..SAMPLE_SIZE {
            column[y] = pixels[y][x];
        }
        let transformed = dct_1d(&column);
        for y in 0..SAMPLE_SIZE {
            columns[y][x] = transformed[y];
        }
    }
    let mut out = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (row_in, row_out) in columns.iter().zip(out.iter_mut()) {
        *row_out = dct_1d(row_in);
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
