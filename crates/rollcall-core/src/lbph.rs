//! Local Binary Pattern Histograms.
//!
//! Each face crop is normalized to a fixed square, turned into an 8-neighbour
//! LBP code image, split into a grid of cells, and described by the
//! concatenated per-cell code histograms. Faces are compared with the
//! alternative chi-square distance over cell-normalized histograms, so two
//! identical crops score 0 and the distance grows with dissimilarity.

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side length every face crop is resized to before encoding.
pub const FACE_SIZE: u32 = 100;
pub const GRID_X: usize = 8;
pub const GRID_Y: usize = 8;

const PATTERNS: usize = 256;

/// Offsets of the 8 neighbours, clockwise from top-left. Bit `k` of a code is
/// set when neighbour `k` is at least as bright as the centre pixel.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

/// Encoding parameters recorded with a trained model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub face_size: u32,
    pub grid_x: usize,
    pub grid_y: usize,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            face_size: FACE_SIZE,
            grid_x: GRID_X,
            grid_y: GRID_Y,
        }
    }
}

impl LbphParams {
    fn cell_size(&self) -> (usize, usize) {
        let coded = self.face_size.saturating_sub(2) as usize;
        (coded / self.grid_x, coded / self.grid_y)
    }

    /// Pixels contributing to each cell histogram.
    pub fn cell_area(&self) -> usize {
        let (w, h) = self.cell_size();
        w * h
    }

    /// Length of one spatial histogram.
    pub fn histogram_len(&self) -> usize {
        self.grid_x * self.grid_y * PATTERNS
    }
}

/// Spatial LBP histogram of one face: raw code counts, cell after cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram(pub Vec<u16>);

impl Histogram {
    /// Encode a face crop of any size.
    pub fn of_face(face: &GrayImage, params: &LbphParams) -> Self {
        let normalized = imageops::resize(face, params.face_size, params.face_size, FilterType::Triangle);
        let codes = lbp_codes(&normalized);
        let coded = params.face_size.saturating_sub(2) as usize;
        let (cell_w, cell_h) = params.cell_size();

        let mut counts = vec![0u16; params.histogram_len()];
        if cell_w == 0 || cell_h == 0 {
            return Self(counts);
        }

        for gy in 0..params.grid_y {
            for gx in 0..params.grid_x {
                let base = (gy * params.grid_x + gx) * PATTERNS;
                for y in gy * cell_h..(gy + 1) * cell_h {
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        let code = codes[y * coded + x] as usize;
                        counts[base + code] = counts[base + code].saturating_add(1);
                    }
                }
            }
        }
        Self(counts)
    }

    /// Alternative chi-square distance, `2 Σ (a-b)² / (a+b)`, over histograms
    /// normalized so each cell sums to 1.
    pub fn distance(&self, other: &Histogram, cell_area: usize) -> f64 {
        if cell_area == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| **a != 0 || **b != 0)
            .map(|(&a, &b)| {
                let (a, b) = (a as f64, b as f64);
                (a - b).powi(2) / (a + b)
            })
            .sum();
        2.0 * sum / cell_area as f64
    }
}

/// LBP code image of a grayscale face, `(w-2) × (h-2)` row-major.
fn lbp_codes(face: &GrayImage) -> Vec<u8> {
    let (w, h) = (face.width() as i32, face.height() as i32);
    if w < 3 || h < 3 {
        return Vec::new();
    }

    let mut codes = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let centre = face.get_pixel(x as u32, y as u32).0[0];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let neighbour = face.get_pixel((x + dx) as u32, (y + dy) as u32).0[0];
                if neighbour >= centre {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }
    codes
}

/// One labeled training histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledHistogram {
    pub label: String,
    pub histogram: Histogram,
}

/// Nearest-neighbour classifier over labeled spatial histograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub params: LbphParams,
    pub samples: Vec<LabeledHistogram>,
}

impl LbphModel {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            samples: Vec::new(),
        }
    }

    pub fn add(&mut self, label: &str, face: &GrayImage) {
        self.samples.push(LabeledHistogram {
            label: label.to_string(),
            histogram: Histogram::of_face(face, &self.params),
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Every stored histogram has the length the parameters call for.
    pub fn is_consistent(&self) -> bool {
        let expected = self.params.histogram_len();
        self.samples.iter().all(|s| s.histogram.0.len() == expected)
    }

    /// Label and distance of the closest training sample.
    pub fn predict(&self, face: &GrayImage) -> Option<(&str, f64)> {
        let probe = Histogram::of_face(face, &self.params);
        let area = self.params.cell_area();

        let mut best: Option<(&str, f64)> = None;
        for sample in &self.samples {
            let d = probe.distance(&sample.histogram, area);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((sample.label.as_str(), d));
            }
        }
        best
    }
}
