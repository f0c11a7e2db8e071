use clap::Parser;
use svr_recon::{dwi_recon_exec, init_thread_pool, DataSetParams, ReconParams};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let ds_params = DataSetParams::parse();
    let param_file = ds_params.recon_params.with_extension("toml");
    let recon_params = match ReconParams::from_file(&param_file) {
        Ok(p) => p,
        Err(e) => {
            error!("failed to load parameter file {}: {}", param_file.display(), e);
            std::process::exit(1);
        }
    };

    let result = init_thread_pool(recon_params.n_threads).and_then(|_| dwi_recon_exec(&ds_params, &recon_params));
    match result {
        Ok(report) => {
            info!(
                "done: {} iterations, relative residual {:.3e}{}",
                report.solve.iterations,
                report.solve.relative_residual,
                if report.solve.converged { "" } else { " (not converged)" }
            );
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
