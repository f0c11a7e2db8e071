//! Grouping of diffusion volumes into shells of (nearly) equal b-value.

use crate::error::{ReconError, Result};

pub const DEFAULT_BZERO_THRESHOLD: f32 = 10.;
pub const DEFAULT_SHELL_EPSILON: f32 = 80.;

#[derive(Debug, Clone, PartialEq)]
pub struct Shell {
    volumes: Vec<usize>,
    mean: f32,
    stdev: f32,
}

impl Shell {
    fn new(volumes: Vec<usize>, bvals: &[f32]) -> Self {
        let n = volumes.len() as f32;
        let mean = volumes.iter().map(|&v| bvals[v]).sum::<f32>() / n;
        let var = volumes.iter().map(|&v| (bvals[v] - mean).powi(2)).sum::<f32>() / n;
        Self { volumes, mean, stdev: var.sqrt() }
    }

    pub fn volumes(&self) -> &[usize] {
        &self.volumes
    }

    pub fn count(&self) -> usize {
        self.volumes.len()
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn stdev(&self) -> f32 {
        self.stdev
    }
}

/// Shells sorted by increasing b-value. Every volume belongs to exactly one shell.
#[derive(Debug, Clone, PartialEq)]
pub struct Shells {
    shells: Vec<Shell>,
    bzero_threshold: f32,
    n_volumes: usize,
}

impl Shells {
    /// Clusters b-values: all volumes at or below the b=0 threshold form one shell, the rest are
    /// split wherever consecutive sorted b-values differ by more than epsilon.
    pub fn new(bvals: &[f32], bzero_threshold: f32, epsilon: f32) -> Self {
        let mut order = (0..bvals.len()).collect::<Vec<usize>>();
        order.sort_by(|&a, &b| bvals[a].total_cmp(&bvals[b]));

        let mut clusters: Vec<Vec<usize>> = vec![];
        let mut prev: Option<f32> = None;
        for v in order {
            let b = bvals[v];
            let same_cluster = match prev {
                Some(p) if p <= bzero_threshold => b <= bzero_threshold,
                Some(p) => b - p <= epsilon,
                None => false,
            };
            if same_cluster {
                clusters.last_mut().expect("cluster exists").push(v);
            } else {
                clusters.push(vec![v]);
            }
            prev = Some(b);
        }

        let shells = clusters
            .into_iter()
            .map(|mut vols| {
                vols.sort();
                Shell::new(vols, bvals)
            })
            .collect();

        Self { shells, bzero_threshold, n_volumes: bvals.len() }
    }

    pub fn count(&self) -> usize {
        self.shells.len()
    }

    pub fn volume_count(&self) -> usize {
        self.n_volumes
    }

    pub fn b_values(&self) -> Vec<f32> {
        self.shells.iter().map(|s| s.mean).collect()
    }

    pub fn counts(&self) -> Vec<usize> {
        self.shells.iter().map(|s| s.count()).collect()
    }

    pub fn has_bzero(&self) -> bool {
        self.shells.first().is_some_and(|s| s.mean <= self.bzero_threshold)
    }

    /// the shell with the most volumes; ties go to the higher b-value
    pub fn largest(&self) -> &Shell {
        self.shells
            .iter()
            .max_by_key(|s| s.count())
            .expect("at least one shell")
    }

    /// shell index of every volume
    pub fn shell_index(&self) -> Vec<usize> {
        let mut idx = vec![0usize; self.n_volumes];
        for (s, shell) in self.shells.iter().enumerate() {
            shell.volumes.iter().for_each(|&v| idx[v] = s);
        }
        idx
    }

    /// sorted volume indices of the shells closest to the requested b-values
    pub fn select(&self, bvals: &[f32]) -> Result<Vec<usize>> {
        let mut volumes = vec![];
        for &b in bvals {
            let shell = self
                .shells
                .iter()
                .find(|s| {
                    let both_bzero = s.mean <= self.bzero_threshold && b <= self.bzero_threshold;
                    let tol = (2. * s.stdev).max(self.bzero_threshold);
                    both_bzero || (s.mean - b).abs() <= tol
                })
                .ok_or(ReconError::ShellSelection(b))?;
            volumes.extend_from_slice(&shell.volumes);
        }
        volumes.sort();
        volumes.dedup();
        Ok(volumes)
    }
}
