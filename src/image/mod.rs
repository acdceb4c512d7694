//! # Image Data Interface
//!
//! The collaborator contract for volumetric time-lapse data. The full
//! multi-resolution image layer lives outside this crate; the engine only
//! needs timepoint/channel counts, a voxel-to-physical transform, and
//! random voxel access. Two RAM-backed sources are provided for tests and
//! embedding.

use crate::{Error, Result};

// ============================================================================
// Affine transform
// ============================================================================

/// Row-major 3x4 affine transform (linear part + translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine3 {
    pub rows: [[f64; 4]; 3],
}

impl Affine3 {
    pub fn identity() -> Self {
        Self {
            rows: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    /// Pure scaling — the transform of a calibrated image with the given
    /// voxel size.
    pub fn scaling(sx: f64, sy: f64, sz: f64) -> Self {
        Self {
            rows: [
                [sx, 0.0, 0.0, 0.0],
                [0.0, sy, 0.0, 0.0],
                [0.0, 0.0, sz, 0.0],
            ],
        }
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let r = &self.rows;
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + r[0][3],
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + r[1][3],
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + r[2][3],
        ]
    }

    /// Inverse transform, or an error for a singular linear part.
    pub fn inverse(&self) -> Result<Affine3> {
        let m = &self.rows;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-300 {
            return Err(Error::ConfigError("singular source transform".into()));
        }
        let inv_det = 1.0 / det;
        // Adjugate of the 3x3 linear part.
        let a = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ];
        let t = [m[0][3], m[1][3], m[2][3]];
        Ok(Affine3 {
            rows: [
                [a[0][0], a[0][1], a[0][2], -(a[0][0] * t[0] + a[0][1] * t[1] + a[0][2] * t[2])],
                [a[1][0], a[1][1], a[1][2], -(a[1][0] * t[0] + a[1][1] * t[1] + a[1][2] * t[2])],
                [a[2][0], a[2][1], a[2][2], -(a[2][0] * t[0] + a[2][1] * t[1] + a[2][2] * t[2])],
            ],
        })
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Random access into one (timepoint, channel, resolution) volume.
pub trait VoxelReader {
    /// Volume extent in voxels per axis.
    fn dims(&self) -> [i64; 3];

    /// Voxel value at integer coordinates. Callers bounds-check against
    /// [`dims`](Self::dims); out-of-range behavior is implementation-defined.
    fn get(&self, x: i64, y: i64, z: i64) -> f64;
}

/// A volumetric time-lapse source with one or more channels.
pub trait ImageSource: Sync {
    fn num_timepoints(&self) -> u32;
    fn num_channels(&self) -> u32;

    /// Voxel-to-physical transform for a timepoint at a resolution level.
    fn source_transform(&self, timepoint: u32, level: u32) -> Affine3;

    /// Open random access into one volume. Workers open their own reader;
    /// readers are not shared across threads.
    fn random_access(&self, timepoint: u32, channel: u32, level: u32) -> Box<dyn VoxelReader + '_>;

    fn space_unit(&self) -> &str {
        "pixel"
    }

    fn time_unit(&self) -> &str {
        "frame"
    }
}

// ============================================================================
// ConstantImage
// ============================================================================

/// Every voxel holds the same value. Test double for exercising the
/// sampling engine with a known ground truth.
pub struct ConstantImage {
    value: f64,
    dims: [i64; 3],
    n_timepoints: u32,
    n_channels: u32,
}

impl ConstantImage {
    pub fn new(value: f64, dims: [i64; 3], n_timepoints: u32, n_channels: u32) -> Self {
        Self { value, dims, n_timepoints, n_channels }
    }
}

struct ConstantReader {
    value: f64,
    dims: [i64; 3],
}

impl VoxelReader for ConstantReader {
    fn dims(&self) -> [i64; 3] {
        self.dims
    }

    fn get(&self, _x: i64, _y: i64, _z: i64) -> f64 {
        self.value
    }
}

impl ImageSource for ConstantImage {
    fn num_timepoints(&self) -> u32 {
        self.n_timepoints
    }

    fn num_channels(&self) -> u32 {
        self.n_channels
    }

    fn source_transform(&self, _timepoint: u32, _level: u32) -> Affine3 {
        Affine3::identity()
    }

    fn random_access(&self, _timepoint: u32, _channel: u32, _level: u32) -> Box<dyn VoxelReader + '_> {
        Box::new(ConstantReader { value: self.value, dims: self.dims })
    }
}

// ============================================================================
// RamImage
// ============================================================================

/// A fully in-memory multi-channel time-lapse with per-axis voxel size.
pub struct RamImage {
    dims: [i64; 3],
    n_timepoints: u32,
    n_channels: u32,
    voxel_size: [f64; 3],
    space_unit: String,
    time_unit: String,
    /// One volume per (timepoint, channel), x-fastest layout.
    volumes: Vec<Vec<f64>>,
}

impl RamImage {
    pub fn new(dims: [i64; 3], n_timepoints: u32, n_channels: u32, voxel_size: [f64; 3]) -> Self {
        let volume_len = (dims[0] * dims[1] * dims[2]) as usize;
        let n = (n_timepoints * n_channels) as usize;
        Self {
            dims,
            n_timepoints,
            n_channels,
            voxel_size,
            space_unit: "pixel".into(),
            time_unit: "frame".into(),
            volumes: vec![vec![0.0; volume_len]; n],
        }
    }

    pub fn with_units(mut self, space_unit: impl Into<String>, time_unit: impl Into<String>) -> Self {
        self.space_unit = space_unit.into();
        self.time_unit = time_unit.into();
        self
    }

    fn volume_index(&self, timepoint: u32, channel: u32) -> usize {
        (timepoint * self.n_channels + channel) as usize
    }

    pub fn set_voxel(&mut self, timepoint: u32, channel: u32, pos: [i64; 3], value: f64) {
        let vi = self.volume_index(timepoint, channel);
        let i = (pos[2] * self.dims[1] + pos[1]) * self.dims[0] + pos[0];
        self.volumes[vi][i as usize] = value;
    }

    pub fn fill(&mut self, timepoint: u32, channel: u32, value: f64) {
        let vi = self.volume_index(timepoint, channel);
        self.volumes[vi].fill(value);
    }
}

struct RamReader<'a> {
    dims: [i64; 3],
    data: &'a [f64],
}

impl VoxelReader for RamReader<'_> {
    fn dims(&self) -> [i64; 3] {
        self.dims
    }

    fn get(&self, x: i64, y: i64, z: i64) -> f64 {
        let i = (z * self.dims[1] + y) * self.dims[0] + x;
        self.data[i as usize]
    }
}

impl ImageSource for RamImage {
    fn num_timepoints(&self) -> u32 {
        self.n_timepoints
    }

    fn num_channels(&self) -> u32 {
        self.n_channels
    }

    fn source_transform(&self, _timepoint: u32, _level: u32) -> Affine3 {
        Affine3::scaling(self.voxel_size[0], self.voxel_size[1], self.voxel_size[2])
    }

    fn random_access(&self, timepoint: u32, channel: u32, _level: u32) -> Box<dyn VoxelReader + '_> {
        let vi = self.volume_index(timepoint, channel);
        Box::new(RamReader { dims: self.dims, data: &self.volumes[vi] })
    }

    fn space_unit(&self) -> &str {
        &self.space_unit
    }

    fn time_unit(&self) -> &str {
        &self.time_unit
    }
}

// ============================================================================
// Tests
// ============================================================================
