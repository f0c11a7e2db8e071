pub mod array_utils;
pub mod basis;
pub mod error;
pub mod io;
pub mod layout;
pub mod operator;
pub mod psf;
pub mod regularization;
pub mod resample;
pub mod sh;
pub mod shells;
pub mod solver;
pub mod transform;

use crate::array_utils::to_col_maj_vec;
use crate::basis::RadialBasis;
use crate::error::{ReconError, Result};
use crate::operator::{LinearOperator, OperatorConfig, ReconMatrix, DEFAULT_ADJOINT_BATCH_SIZE};
use crate::psf::{InterpKernel, KernelType, SliceProfile};
use crate::regularization::Regularization;
use crate::shells::{Shells, DEFAULT_BZERO_THRESHOLD, DEFAULT_SHELL_EPSILON};
use crate::solver::{cgls, SolveReport, DEFAULT_MAX_ITER, DEFAULT_TOLERANCE};
use crate::transform::GridHeader;
use clap::Parser;
use ndarray::{Array2, Array4, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reconstruction parameters, read from a toml file. Missing entries take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconParams {
    /// maximum harmonic order (even). Defaults to 4, or the highest order of the radial bases
    pub lmax: Option<usize>,
    /// relative normal-equation residual at which the solver stops
    pub tolerance: f64,
    pub max_iter: usize,
    /// FWHM of the gaussian slice profile relative to the slice spacing. 0 gives a delta profile
    pub ssp_thickness: f32,
    /// text file with a tabulated slice profile, overrides `ssp_thickness`
    pub ssp_file: Option<PathBuf>,
    pub kernel: KernelType,
    pub kernel_half_width: usize,
    /// weight of the 3-D Laplacian regulariser
    pub reg_spatial: f32,
    /// weight of the through-slice Laplacian regulariser
    pub reg_slice: f32,
    /// zero-pad the coefficient output to this many volumes
    pub padding: Option<usize>,
    /// keep every slice matrix in memory for the duration of the solve
    pub cache_slice_matrices: bool,
    /// acquisitions per adjoint batch
    pub adjoint_batch_size: usize,
    /// worker threads, all cores if unset
    pub n_threads: Option<usize>,
    pub bzero_threshold: f32,
    pub shell_epsilon: f32,
    /// b-values of the shells to reconstruct from, all shells if unset
    pub shells: Option<Vec<f32>>,
    /// fill excluded slices in the source prediction
    pub complete_prediction: bool,
}

impl Default for ReconParams {
    fn default() -> Self {
        Self {
            lmax: None,
            tolerance: DEFAULT_TOLERANCE,
            max_iter: DEFAULT_MAX_ITER,
            ssp_thickness: 1.,
            ssp_file: None,
            kernel: KernelType::Sinc,
            kernel_half_width: 2,
            reg_spatial: 0.,
            reg_slice: 0.,
            padding: None,
            cache_slice_matrices: false,
            adjoint_batch_size: DEFAULT_ADJOINT_BATCH_SIZE,
            n_threads: None,
            bzero_threshold: DEFAULT_BZERO_THRESHOLD,
            shell_epsilon: DEFAULT_SHELL_EPSILON,
            shells: None,
            complete_prediction: false,
        }
    }
}

impl ReconParams {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    fn slice_profile(&self) -> Result<SliceProfile> {
        match &self.ssp_file {
            Some(f) => {
                let table = io::read_matrix(f)?;
                SliceProfile::tabulated(&table.iter().copied().collect::<Vec<f32>>())
            }
            None => SliceProfile::gaussian(self.ssp_thickness),
        }
    }

    fn operator_config(&self) -> Result<OperatorConfig> {
        Ok(OperatorConfig {
            lmax: self.lmax,
            ssp: self.slice_profile()?,
            kernel: InterpKernel::new(self.kernel, self.kernel_half_width)?,
            regularization: Regularization::new(self.reg_spatial, self.reg_slice),
            cache_slice_matrices: self.cache_slice_matrices,
            adjoint_batch_size: self.adjoint_batch_size,
        })
    }
}

/// Input and output locations of one reconstruction.
#[derive(Debug, Clone, Parser)]
#[command(about = "slice-to-volume reconstruction of diffusion weighted images")]
pub struct DataSetParams {
    /// 4-D diffusion weighted image (.npy, x y z volume)
    #[arg(long, required_unless_present = "raw_slices")]
    pub dwi: Option<PathBuf>,
    /// glob pattern of raw big-endian i16 slices, read in (slice, volume) order instead of --dwi
    #[arg(long, requires = "dims", conflicts_with = "dwi")]
    pub raw_slices: Option<String>,
    /// image dimensions of the raw slice stack
    #[arg(long, num_args = 4, value_names = ["NX", "NY", "NZ", "NV"])]
    pub dims: Option<Vec<usize>>,
    /// gradient table, one row (x y z b) per volume
    #[arg(long)]
    pub grad: PathBuf,
    /// output coefficient image (.npy)
    #[arg(long)]
    pub output: PathBuf,
    /// reconstruction parameter file (.toml)
    #[arg(long)]
    pub recon_params: PathBuf,
    /// rigid motion table, one row (tx ty tz rx ry rz) per volume or per slice
    #[arg(long)]
    pub motion: Option<PathBuf>,
    /// slice weights, one row per slice and one column per volume
    #[arg(long)]
    pub weights: Option<PathBuf>,
    /// voxel weight image (.npy) with the shape of the input
    #[arg(long)]
    pub voxel_weights: Option<PathBuf>,
    /// radial basis file, one row per shell and one column per even harmonic order. Repeatable
    #[arg(long = "rf")]
    pub rf: Vec<PathBuf>,
    /// initial coefficient image (.npy)
    #[arg(long)]
    pub init: Option<PathBuf>,
    /// voxel size in mm
    #[arg(long, num_args = 3, value_names = ["DX", "DY", "DZ"])]
    pub voxel_size: Option<Vec<f64>>,
    /// write the source prediction in acquired slice space
    #[arg(long)]
    pub spred: Option<PathBuf>,
    /// write the registration prediction along the rotated gradient direction of every slice
    #[arg(long)]
    pub rpred: Option<PathBuf>,
    /// write the spherical harmonic coefficients of every shell
    #[arg(long)]
    pub shell_sh: Option<PathBuf>,
    /// measure the adjoint consistency of the operator before solving
    #[arg(long)]
    pub check_adjoint: bool,
}

/// Summary written next to the coefficient image.
#[derive(Debug, Clone, Serialize)]
pub struct ReconReport {
    #[serde(flatten)]
    pub solve: SolveReport,
    pub lmax: usize,
    pub n_coefs: usize,
    pub rows: usize,
    pub cols: usize,
    pub shells: Vec<f32>,
    pub shell_counts: Vec<usize>,
    pub adjoint_mismatch: Option<f64>,
}

/// sizes the global rayon pool; must run before any parallel work
pub fn init_thread_pool(n_threads: Option<usize>) -> Result<()> {
    if let Some(n) = n_threads {
        rayon::ThreadPoolBuilder::new().num_threads(n).build_global()?;
        info!("using {} worker threads", n);
    }
    Ok(())
}

/// Every table keyed by volume, loaded and checked against the image.
struct DataSet {
    dwi: Array4<f32>,
    grad: Array2<f32>,
    motion: Option<Array2<f32>>,
    weights: Option<Array2<f32>>,
    voxel_weights: Option<Array4<f32>>,
}

impl DataSet {
    fn load(ds: &DataSetParams) -> Result<Self> {
        let dwi = match (&ds.dwi, &ds.raw_slices, &ds.dims) {
            (_, Some(pattern), Some(dims)) => {
                let dims: [usize; 4] = dims
                    .as_slice()
                    .try_into()
                    .map_err(|_| ReconError::Parameter("--dims takes four values".to_string()))?;
                info!("reading raw slices from {} ...", pattern);
                io::read_raw_slices(pattern, &dims)?
            }
            (Some(path), _, _) => {
                info!("reading {} ...", path.display());
                io::read_image4(path)?
            }
            _ => return Err(ReconError::Parameter("no input image given".to_string())),
        };
        let n_vols = dwi.dim().3;

        let grad = io::read_matrix(&ds.grad)?;
        if grad.ncols() != 4 {
            return Err(ReconError::GradientColumns { expected: "4 (x y z b)", found: grad.ncols() });
        }
        if grad.nrows() != n_vols {
            return Err(ReconError::GradientRows { expected: n_vols, found: grad.nrows() });
        }

        let motion = ds.motion.as_ref().map(io::read_matrix).transpose()?;
        let weights = ds.weights.as_ref().map(io::read_matrix).transpose()?;
        let voxel_weights = ds.voxel_weights.as_ref().map(io::read_image4).transpose()?;

        Ok(Self { dwi, grad, motion, weights, voxel_weights })
    }

    fn n_vols(&self) -> usize {
        self.dwi.dim().3
    }

    /// Restricts every table to the given volumes. Per-slice motion keeps rows v*nz..v*nz+nz of
    /// each selected volume v.
    fn select_volumes(self, vols: &[usize]) -> Result<Self> {
        let (nx, ny, nz, nv) = self.dwi.dim();
        if let Some(w) = &self.voxel_weights {
            if w.dim() != (nx, ny, nz, nv) {
                return Err(ReconError::VoxelWeightShape { expected: vec![nx, ny, nz, nv], found: w.shape().to_vec() });
            }
        }
        let motion = match self.motion {
            Some(m) if m.nrows() == nv => Some(m.select(Axis(0), vols)),
            Some(m) if m.nrows() == nv * nz => {
                let rows = vols.iter().flat_map(|&v| v * nz..(v + 1) * nz).collect::<Vec<_>>();
                Some(m.select(Axis(0), &rows))
            }
            Some(m) => return Err(ReconError::MotionRows { rows: m.nrows(), n_vols: nv, n_slices: nv * nz }),
            None => None,
        };
        let weights = match self.weights {
            Some(w) if w.dim() == (nz, nv) => Some(w.select(Axis(1), vols)),
            Some(w) => {
                return Err(ReconError::WeightShape { expected_rows: nz, expected_cols: nv, rows: w.nrows(), cols: w.ncols() })
            }
            None => None,
        };
        Ok(Self {
            dwi: self.dwi.select(Axis(3), vols),
            grad: self.grad.select(Axis(0), vols),
            motion,
            weights,
            voxel_weights: self.voxel_weights.map(|w| w.select(Axis(3), vols)),
        })
    }
}

fn detect_shells(grad: &Array2<f32>, params: &ReconParams) -> Shells {
    let bvals = grad.column(3).to_vec();
    let shells = Shells::new(&bvals, params.bzero_threshold, params.shell_epsilon);
    info!("found {} shells, b = {:?}, counts = {:?}", shells.count(), shells.b_values(), shells.counts());
    if !shells.has_bzero() {
        debug!("no b=0 volumes below b = {}", params.bzero_threshold);
    }
    if shells.count() > 0 {
        let largest = shells.largest();
        debug!("largest shell: b = {:.1} +/- {:.1} ({} volumes)", largest.mean(), largest.stdev(), largest.count());
    }
    shells
}

fn load_radial_bases(files: &[PathBuf]) -> Result<Vec<RadialBasis>> {
    files
        .iter()
        .map(|f| -> Result<RadialBasis> {
            let name = f.file_stem().map_or_else(|| f.display().to_string(), |s| s.to_string_lossy().to_string());
            Ok(RadialBasis::new(name, io::read_matrix(f)?))
        })
        .collect()
}

fn load_init(path: &Path, expected: [usize; 4]) -> Result<Vec<f32>> {
    let init = io::read_image4(path)?;
    if init.shape() != expected.as_slice() {
        return Err(ReconError::InitShape { expected: expected.to_vec(), found: init.shape().to_vec() });
    }
    let mut x = to_col_maj_vec(&init.view());
    io::replace_non_finite(&mut x);
    Ok(x)
}

/// Runs a full reconstruction: loads the data set, builds the operator, solves for the
/// coefficients and writes every requested output.
pub fn dwi_recon_exec(ds: &DataSetParams, params: &ReconParams) -> Result<ReconReport> {
    let mut data = DataSet::load(ds)?;
    let mut shells = detect_shells(&data.grad, params);

    if let Some(b) = &params.shells {
        let vols = shells.select(b)?;
        info!("reconstructing from {} of {} volumes", vols.len(), data.n_vols());
        data = data.select_volumes(&vols)?;
        shells = detect_shells(&data.grad, params);
    }

    // without a radial basis the model spans a single shell
    if ds.rf.is_empty() && shells.count() > 1 {
        if params.shells.is_some() {
            return Err(ReconError::SingleShell(shells.count()));
        }
        let largest = shells.largest();
        info!("no radial basis given, reconstructing the largest shell (b = {:.1}, {} volumes)", largest.mean(), largest.count());
        let vols = largest.volumes().to_vec();
        data = data.select_volumes(&vols)?;
        shells = detect_shells(&data.grad, params);
    }

    let (nx, ny, nz, nv) = data.dwi.dim();
    let voxel_size: [f64; 3] = match &ds.voxel_size {
        Some(v) => v
            .as_slice()
            .try_into()
            .map_err(|_| ReconError::Parameter("--voxel-size takes three values".to_string()))?,
        None => [1., 1., 1.],
    };
    let header = GridHeader::new([nx, ny, nz], voxel_size);
    debug!("grid {:?}, voxel size {:?}, {} volumes", header.size, voxel_size, nv);

    let rf = load_radial_bases(&ds.rf)?;
    let config = params.operator_config()?;

    let mut op = ReconMatrix::new(header, nv, &data.grad.view(), &shells, data.motion.as_ref().map(|m| m.view()), &rf, &config)?;
    if let Some(w) = data.weights.take() {
        op = op.with_slice_weights(w)?;
    }
    if let Some(w) = &data.voxel_weights {
        op = op.with_voxel_weights(w.view())?;
    }
    let nc = op.n_coefs();

    let n_out = params.padding.unwrap_or(nc);
    if n_out < nc {
        return Err(ReconError::Padding { padding: n_out, n_coefs: nc });
    }

    let init = ds.init.as_ref().map(|p| load_init(p, [nx, ny, nz, nc])).transpose()?;

    let adjoint_mismatch = if ds.check_adjoint {
        let m = op.adjoint_mismatch(0);
        info!("adjoint mismatch: {:.3e}", m);
        Some(m)
    } else {
        None
    };

    info!("solving for {} unknowns from {} equations ...", op.cols(), op.rows());
    let rhs = op.weighted_rhs(&to_col_maj_vec(&data.dwi.view()));
    let (x, solve) = cgls(&op, &rhs, init.as_deref(), params.tolerance, params.max_iter);

    let nxyz = nx * ny * nz;
    let mut coefs = x.clone();
    coefs.resize(nxyz * n_out, 0.);
    io::write_image(&ds.output, &io::image_from_col_maj(&[nx, ny, nz, n_out], coefs)?)?;
    info!("wrote coefficients to {}", ds.output.display());

    // one row per coefficient, one column per voxel
    let xm = ArrayView2::from_shape((nc, nxyz), &x).map_err(|e| ReconError::Parameter(e.to_string()))?;

    if let Some(path) = &ds.spred {
        let pred = op.predict(&x, params.complete_prediction);
        io::write_image(path, &io::image_from_col_maj(&[nx, ny, nz, nv], pred)?)?;
        info!("wrote source prediction to {}", path.display());
    }

    if let Some(path) = &ds.rpred {
        // one volume per acquisition (v, z), along its motion-rotated direction
        let pred = op.basis().y().dot(&xm);
        let n_acq = pred.nrows();
        io::write_image(path, &io::image_from_col_maj(&[nx, ny, nz, n_acq], pred.into_raw_vec())?)?;
        info!("wrote registration prediction to {}", path.display());
    }

    if let Some(path) = &ds.shell_sh {
        let basis = op.basis();
        let n_sh = sh::n_for_l(basis.lmax());
        let mut out = Vec::with_capacity(nxyz * n_sh * basis.n_shells());
        for s in 0..basis.n_shells() {
            let shell_coefs = basis.shell_basis(s).t().dot(&xm);
            out.extend(shell_coefs.iter());
        }
        io::write_image(path, &io::image_from_col_maj(&[nx, ny, nz, n_sh, basis.n_shells()], out)?)?;
        info!("wrote per-shell harmonics to {}", path.display());
    }

    let report = ReconReport {
        solve,
        lmax: op.basis().lmax(),
        n_coefs: nc,
        rows: op.rows(),
        cols: op.cols(),
        shells: shells.b_values(),
        shell_counts: shells.counts(),
        adjoint_mismatch,
    };
    let report_path = ds.output.with_extension("json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    debug!("wrote solve report to {}", report_path.display());

    Ok(report)
}
