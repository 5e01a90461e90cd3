//! Output file naming: `<label>_runXX_cameraXX.h264`.
//!
//! One run number is shared by every camera of a recording: the first run for
//! which none of the camera files exists yet.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

const MAX_RUN: u32 = 9_999;

pub fn output_filename(label: &str, run: u32, camera_index: usize) -> String {
    format!("{}_run{:02}_camera{:02}.h264", label, run, camera_index + 1)
}

/// Paths for `cameras` outputs of the next free run in `dir`.
pub fn next_run_outputs(dir: &Path, label: &str, cameras: usize) -> Result<(u32, Vec<PathBuf>)> {
    for run in 1..=MAX_RUN {
        let paths: Vec<PathBuf> = (0..cameras)
            .map(|index| dir.join(output_filename(label, run, index)))
            .collect();
        if paths.iter().all(|path| !path.exists()) {
            return Ok((run, paths));
        }
    }
    Err(anyhow!(
        "no free run number for label '{}' in {}",
        label,
        dir.display()
    ))
}
