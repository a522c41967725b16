// Create ensemble-average land forcing (lfo) files.
//
// The ensemble of input files must be staged as
//
//   <in_path>/atmens/ensdiag/mem<NNN>/<EXPID>.<HISTSPECa>_lfo_<HISTSPECb>.<YYYYMMDD_HHMM>z.nc4
//
// where <NNN> is the three-digit ensemble ID (1 to nens). This matches the
// directory layout generated by the ensemble component of the GEOS
// atmospheric data assimilation system (ADAS). One averaged file is written
// per timestamp and HISTORY spec, named like its inputs, directly under
// <out_path>.
//
// USAGE #### avg_ensemble_forcing <in_path> <out_path> <nens> [--cmd <averaging_command>]
//
// The averaging command defaults to `ncea` (NCO) and is run once per aligned
// group as: <cmd> <member files..> <output file>.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use std::{env, path::Path};

use avg_ensemble_forcing::{average_ensemble_forcing, EnsembleLayout, NceaAverager};

fn main() -> Result<()> {
    let start: DateTime<Local> = Local::now();

    let mut args: Vec<String> = env::args().collect();

    let mut command = String::from("ncea");
    if let Some(i) = args.iter().position(|a| a == "--cmd") {
        if i + 1 >= args.len() {
            eprintln!("--cmd needs a value");
            std::process::exit(1);
        }
        command = args.remove(i + 1);
        args.remove(i);
    }

    if args.len() != 4 {
        eprintln!(
            "Usage: {} <in_path> <out_path> <nens> [--cmd <averaging_command>]",
            args[0]
        );
        std::process::exit(1);
    }
    let in_path = Path::new(&args[1]);
    let out_path = Path::new(&args[2]);
    let nens: usize = args[3]
        .parse()
        .with_context(|| format!("nens must be a positive integer, got '{}'", args[3]))?;
    if nens == 0 {
        bail!("nens must be a positive integer, got 0");
    }

    println!(
        "[{}] Averaging {} ensemble members: {} -> {}",
        start.format("%Y-%m-%d %H:%M:%S"),
        nens,
        in_path.display(),
        out_path.display()
    );

    let layout = EnsembleLayout::default();
    let averager = NceaAverager::with_command(command);
    let summary = average_ensemble_forcing(in_path, out_path, nens, &layout, &averager)?;

    println!("\nSummary:");
    println!("  Groups:   {}", summary.groups);
    println!("  Averaged: {}", summary.averaged);
    println!("  Failed:   {}", summary.failures.len());

    let end: DateTime<Local> = Local::now();
    let elapsed = end.signed_duration_since(start).num_seconds();
    println!(
        "[{}] Finished. Total time: {}s",
        end.format("%Y-%m-%d %H:%M:%S"),
        elapsed
    );

    if !summary.failures.is_empty() {
        bail!("{} averaging command(s) failed", summary.failures.len());
    }

    Ok(())
}
