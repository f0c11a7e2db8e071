use clap::Parser;
use std::path::PathBuf;
use svr_recon::ReconParams;

/// Writes a reconstruction parameter file with every entry at its default.
#[derive(Debug, Parser)]
struct Args {
    /// parameter file to write (.toml is appended)
    parameter_file: PathBuf,
    /// harmonic order to write instead of the automatic choice
    #[arg(long)]
    lmax: Option<usize>,
    /// b-values of the shells to reconstruct from
    #[arg(long, num_args = 1..)]
    shells: Option<Vec<f32>>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let params = ReconParams { lmax: args.lmax, shells: args.shells, ..Default::default() };
    let mut toml_string = toml::to_string(&params)?;
    toml_string.push('\n');
    let filename = args.parameter_file.with_extension("toml");
    std::fs::write(&filename, toml_string)?;
    println!("wrote default parameter file to {}", filename.display());
    Ok(())
}
