use anyhow::{Context, Result};
use chrono::Local;
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────
// Ensemble layout
// ─────────────────────────────────────────────────────────────────────

/// Where the ensemble is staged and which files count as forcing output.
///
/// The defaults match the directory/file structure generated by the
/// ensemble component of the GEOS atmospheric data assimilation system:
///
///   `<in_path>/atmens/ensdiag/mem<NNN>/*lfo*.nc4`
///
/// with `<NNN>` the ensemble index zero-padded to three digits.
#[derive(Debug, Clone)]
pub struct EnsembleLayout {
    /// Relative subpath under the input root holding the member directories
    pub member_subdir: String,
    /// Member directory prefix, followed by the padded index
    pub member_prefix: String,
    /// Substring a file name must contain to be picked up
    pub marker: String,
    /// Required file extension (without the dot)
    pub extension: String,
}

impl Default for EnsembleLayout {
    fn default() -> Self {
        EnsembleLayout {
            member_subdir: "atmens/ensdiag".into(),
            member_prefix: "mem".into(),
            marker: "lfo".into(),
            extension: "nc4".into(),
        }
    }
}

impl EnsembleLayout {
    /// Member directory for a 1-based ensemble index, e.g. `mem001`.
    pub fn member_dir(&self, in_path: &Path, index: usize) -> PathBuf {
        in_path
            .join(&self.member_subdir)
            .join(format!("{}{:03}", self.member_prefix, index))
    }

    fn file_pattern(&self, in_path: &Path, index: usize) -> String {
        format!(
            "{}/*{}*.{}",
            self.member_dir(in_path, index).display(),
            self.marker,
            self.extension
        )
    }
}

// ─────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────

/// All matching forcing files of one member, sorted lexically.
///
/// A member directory that does not exist matches nothing and yields an
/// empty list rather than an error.
pub fn member_files(
    in_path: &Path,
    layout: &EnsembleLayout,
    index: usize,
) -> Result<Vec<PathBuf>> {
    let mut v: Vec<_> = glob(&layout.file_pattern(in_path, index))?
        .filter_map(Result::ok)
        .collect();
    v.sort();
    Ok(v)
}

// ─────────────────────────────────────────────────────────────────────
// Alignment
// ─────────────────────────────────────────────────────────────────────

/// One file per member, all believed to carry the same timestamp/spec.
#[derive(Debug)]
pub struct AlignedGroup {
    /// Shared base file name; the output file is named after it
    pub name: String,
    /// Full input paths, in member order
    pub inputs: Vec<PathBuf>,
}

#[derive(Error, Debug)]
pub enum AlignError {
    #[error(
        "misaligned ensemble at position {pos}: member {member} has '{found}', \
         expected '{expected}'. Each member directory should hold the same files"
    )]
    NameMismatch {
        pos: usize,
        member: usize,
        expected: String,
        found: String,
    },
    #[error("no usable file name in {}", .path.display())]
    BadFileName { path: PathBuf },
}

fn base_name(path: &Path) -> Result<&str, AlignError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AlignError::BadFileName {
            path: path.to_path_buf(),
        })
}

/// Number of positions present in every member list. Trailing files of
/// longer lists have no counterpart and are dropped.
pub fn aligned_depth(lists: &[Vec<PathBuf>]) -> usize {
    lists.iter().map(Vec::len).min().unwrap_or(0)
}

/// Element `pos` of every member list as one group. The first member is
/// the reference; every other base file name must equal it.
///
/// `pos` must be below [`aligned_depth`] for these lists.
pub fn align_at(lists: &[Vec<PathBuf>], pos: usize) -> Result<AlignedGroup, AlignError> {
    let reference = base_name(&lists[0][pos])?;
    for (m, list) in lists.iter().enumerate().skip(1) {
        let found = base_name(&list[pos])?;
        if found != reference {
            return Err(AlignError::NameMismatch {
                pos,
                member: m + 1,
                expected: reference.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(AlignedGroup {
        name: reference.to_string(),
        inputs: lists.iter().map(|l| l[pos].clone()).collect(),
    })
}

// ─────────────────────────────────────────────────────────────────────
// External averaging command
// ─────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("could not launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Element-wise mean over structurally identical input files, written to
/// `output`. The schema of the files is the implementation's business.
pub trait Averager {
    fn average(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError>;
}

/// Drives the NCO ensemble averager (`ncea <inputs..> <output>`), or any
/// command taking the same argument convention.
pub struct NceaAverager {
    command: PathBuf,
}

impl NceaAverager {
    pub fn new() -> Self {
        Self::with_command("ncea")
    }

    pub fn with_command(command: impl Into<PathBuf>) -> Self {
        NceaAverager {
            command: command.into(),
        }
    }

    fn command_name(&self) -> String {
        self.command.display().to_string()
    }
}

impl Default for NceaAverager {
    fn default() -> Self {
        Self::new()
    }
}

impl Averager for NceaAverager {
    fn average(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        let out = Command::new(&self.command)
            .args(inputs)
            .arg(output)
            .output()
            .map_err(|source| ToolError::Spawn {
                command: self.command_name(),
                source,
            })?;
        if !out.status.success() {
            return Err(ToolError::Failed {
                command: self.command_name(),
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────

/// Outcome of one run: aligned groups found, groups averaged cleanly, and
/// the per-group command failures that were recorded instead of aborting.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub groups: usize,
    pub averaged: usize,
    pub failures: Vec<(String, ToolError)>,
}

/// Average every aligned group of forcing files under `in_path` into
/// `out_path`, one output file per group, named like its inputs.
///
/// Member directories that do not exist contribute empty lists; if the
/// lists have unequal lengths only the common-length prefix is averaged.
/// A base-filename mismatch aborts the run where it stands — groups at
/// earlier positions have already been dispatched, the mismatched one and
/// everything after it never run. A failing averaging command is logged
/// and recorded in the summary, and later groups still run.
pub fn average_ensemble_forcing(
    in_path: &Path,
    out_path: &Path,
    nens: usize,
    layout: &EnsembleLayout,
    averager: &impl Averager,
) -> Result<RunSummary> {
    fs::create_dir_all(out_path)
        .with_context(|| format!("creating output directory {}", out_path.display()))?;

    let mut lists = Vec::with_capacity(nens);
    for i in 1..=nens {
        lists.push(member_files(in_path, layout, i)?);
    }

    let mut summary = RunSummary {
        groups: aligned_depth(&lists),
        ..RunSummary::default()
    };

    for pos in 0..summary.groups {
        let group = align_at(&lists, pos)?;
        let target = out_path.join(&group.name);
        eprintln!("  └─ averaging {} ({} members)", group.name, group.inputs.len());
        match averager.average(&group.inputs, &target) {
            Ok(()) => summary.averaged += 1,
            Err(e) => {
                eprintln!(
                    "[{}] {}: {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    group.name,
                    e
                );
                summary.failures.push((group.name, e));
            }
        }
    }

    Ok(summary)
}
