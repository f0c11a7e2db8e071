use std::path::PathBuf;
use thiserror::Error;

/// Configuration and input errors. All of these are raised before any operator product is
/// evaluated and abort the reconstruction.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("no. columns in motion parameters must equal 6, found {0}")]
    MotionColumns(usize),

    #[error("no. rows in motion parameters ({rows}) must equal the number of volumes ({n_vols}) or slices ({n_slices})")]
    MotionRows {
        rows: usize,
        n_vols: usize,
        n_slices: usize,
    },

    #[error("no. rows in gradient table ({found}) must equal the number of volumes ({expected})")]
    GradientRows { expected: usize, found: usize },

    #[error("gradient table must have {expected} columns, found {found}")]
    GradientColumns { expected: &'static str, found: usize },

    #[error("motion parameters in row {0} are not finite")]
    MotionNonFinite(usize),

    #[error("reconstruction without a radial basis takes a single shell, found {0} (select one with `shells`)")]
    SingleShell(usize),

    #[error("weight matrix must have shape (nz, nv) = ({expected_rows}, {expected_cols}), found ({rows}, {cols})")]
    WeightShape {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("voxel weight image must have shape {expected:?}, found {found:?}")]
    VoxelWeightShape { expected: Vec<usize>, found: Vec<usize> },

    #[error("radial basis '{name}' has {found} rows, but {expected} shells were detected")]
    RadialBasisShells {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("radial basis '{0}' must have at least one column")]
    RadialBasisEmpty(String),

    #[error("requested padding ({padding}) is smaller than the number of basis coefficients ({n_coefs})")]
    Padding { padding: usize, n_coefs: usize },

    #[error("slice profile must have an odd number of weights, found {0}")]
    SliceProfileLength(usize),

    #[error("slice profile weights must be non-negative with a positive sum")]
    SliceProfileWeights,

    #[error("initialisation image must have shape {expected:?}, found {found:?}")]
    InitShape { expected: Vec<usize>, found: Vec<usize> },

    #[error("input image must be 4-D (x, y, z, volumes), found {0} dimensions")]
    ImageDims(usize),

    #[error("no shell matching b = {0} was found")]
    ShellSelection(f32),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("failed to parse matrix file {path}: {reason}")]
    MatrixParse { path: PathBuf, reason: String },

    #[error("failed to read image {path}: {reason}")]
    ImageRead { path: PathBuf, reason: String },

    #[error("failed to write image {path}: {reason}")]
    ImageWrite { path: PathBuf, reason: String },

    #[error("failed to parse parameter file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to serialize solve report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to set up worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconError>;
