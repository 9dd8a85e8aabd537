// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use log::{debug, warn};

use skystack_elements::astro_util::CelestialLocation;

// Downloaded exposures are named exposure_<n>.<ext>, n counting from 1.
const EXPOSURE_PREFIX: &str = "exposure_";

// Where downloaded exposures live between download and stacking. Only one
// acquisition uses a given directory at a time.
#[derive(Clone, Debug)]
pub struct ScratchDir {
    dir: PathBuf,
    extension: String,
}

impl ScratchDir {
    pub fn new(dir: impl AsRef<Path>, extension: &str) -> Result<Self, CanonicalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| internal_error(
            format!("Cannot create scratch dir {:?}: {:?}", dir, e).as_str()))?;
        Ok(ScratchDir{dir, extension: extension.to_string()})
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // `index` is 1-based.
    pub fn exposure_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{}.{}", EXPOSURE_PREFIX, index, self.extension))
    }

    fn pattern(&self) -> Result<String, CanonicalError> {
        let dir = self.dir.to_str().ok_or_else(|| invalid_argument_error(
            format!("Scratch dir {:?} is not valid UTF-8", self.dir).as_str()))?;
        Ok(format!("{}/{}*.{}", glob::Pattern::escape(dir),
                   EXPOSURE_PREFIX, self.extension))
    }

    // Lists all exposure scratch files currently present.
    pub fn exposures(&self) -> Result<Vec<PathBuf>, CanonicalError> {
        let pattern = self.pattern()?;
        let paths = glob::glob(&pattern).map_err(|e| internal_error(
            format!("Bad scratch pattern {}: {:?}", pattern, e).as_str()))?;
        Ok(paths.filter_map(|p| p.ok()).collect())
    }

    // Deletes every exposure scratch file. Returns how many were removed.
    pub fn remove_exposures(&self) -> Result<usize, CanonicalError> {
        let mut removed = 0;
        for path in self.exposures()? {
            fs::remove_file(&path).map_err(|e| internal_error(
                format!("Cannot remove {:?}: {:?}", path, e).as_str()))?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Removed {} exposure scratch files", removed);
        }
        Ok(removed)
    }
}

// Deletes the given exposure files when dropped, so that they are gone once
// stacking is over whether or not it succeeded.
pub struct ExposureCleanup {
    paths: Vec<PathBuf>,
}

impl ExposureCleanup {
    pub fn new() -> Self {
        ExposureCleanup{paths: Vec::new()}
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Default for ExposureCleanup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExposureCleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => {},
                // Download may have failed before the file was created.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => { warn!("Cannot remove {:?}: {:?}", path, e); }
            }
        }
    }
}

// Name of the final image for `location`, e.g. "RA_83.822__DEC_-5.391.jpeg".
// Whole degrees print without a fraction: "RA_10__DEC_20.jpeg".
pub fn output_file_name(location: &CelestialLocation, extension: &str) -> String {
    format!("RA_{}__DEC_{}.{}", location.ra, location.dec, extension)
}

// mod tests.
