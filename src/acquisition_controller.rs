// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, CanonicalErrorCode, data_loss_error, internal_error,
                      invalid_argument_error, not_found_error, resource_exhausted_error};
use log::{debug, error, info, warn};

use skystack_elements::astro_util::{CelestialLocation, LocationSampler, VisitedLocations,
                                    angular_separation};
use skystack_elements::image_utils::{equalize_histogram, smooth};
use skystack_elements::stacker_trait::ExposureStacker;
use skystack_elements::straighten::{GeometryNormalizer, NormalizerConfig};

use crate::archive_client::{ArchiveClient, ProductType, validate_query};
use crate::grouping::{group_by_location, select_group};
use crate::scratch::{ExposureCleanup, ScratchDir, output_file_name};

#[derive(Clone, Debug)]
pub struct AcquisitionConfig {
    // Final images are written here. Created if missing.
    pub output_dir: PathBuf,

    // Downloaded exposures live here until stacked. None means `output_dir`.
    pub scratch_dir: Option<PathBuf>,

    // Extension (and thus encoding) of scratch and output images.
    pub image_extension: String,

    pub search_radius_deg: f64,
    pub product_type: ProductType,
    pub instrument: String,

    // A location is only stacked if its best group has at least this many
    // exposures.
    pub min_exposures: usize,

    // Pause before retrying a location after a transient failure.
    pub retry_delay: Duration,

    // Attempts (retries plus resamples) allowed for one output image. None
    // is unbounded.
    pub max_attempts_per_image: Option<u32>,

    // Median filter radius applied to the stacked image. Zero disables.
    pub smoothing_radius: u32,

    pub normalizer: NormalizerConfig,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig{
            output_dir: PathBuf::from("./images"),
            scratch_dir: None,
            image_extension: "jpeg".to_string(),
            search_radius_deg: 0.4,
            product_type: ProductType::Exposure,
            instrument: "WFC3".to_string(),
            min_exposures: 5,
            retry_delay: Duration::from_secs(1),
            max_attempts_per_image: None,
            smoothing_radius: 2,
            normalizer: NormalizerConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.image_extension.is_empty() ||
            !self.image_extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid_argument_error(
                format!("Bad image extension '{}'", self.image_extension).as_str()));
        }
        if self.min_exposures == 0 {
            return Err(invalid_argument_error("min_exposures must be at least 1"));
        }
        if self.max_attempts_per_image == Some(0) {
            return Err(invalid_argument_error("max_attempts_per_image must be positive"));
        }
        // Any in-range location will do for checking the rest.
        validate_query(&CelestialLocation::new(0.0, 0.0),
                       self.search_radius_deg, &self.instrument)
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch_dir.as_deref().unwrap_or(&self.output_dir)
    }
}

/// Result of one fetch attempt at a location.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The final image was written to this path.
    Success(PathBuf),
    /// Network trouble; try the same location again.
    Retryable(CanonicalError),
    /// Nothing usable at this location; pick another one.
    Abandon(CanonicalError),
}

// Sorts a failed attempt by what the caller should do next. Configuration
// errors are passed back as Err since no location can succeed with them.
pub fn classify(err: CanonicalError) -> Result<FetchOutcome, CanonicalError> {
    if is_transient(&err) {
        Ok(FetchOutcome::Retryable(err))
    } else if err.code == CanonicalErrorCode::InvalidArgument {
        Err(err)
    } else {
        Ok(FetchOutcome::Abandon(err))
    }
}

fn is_transient(err: &CanonicalError) -> bool {
    matches!(err.code, CanonicalErrorCode::Unavailable | CanonicalErrorCode::DeadlineExceeded)
}

#[derive(Debug, Default)]
pub struct RunSummary {
    // Images written, in acquisition order.
    pub outputs: Vec<PathBuf>,
    pub retries: u32,
    pub abandoned: u32,
}

pub struct AcquisitionController {
    archive: Box<dyn ArchiveClient>,
    stacker: Box<dyn ExposureStacker>,
    sampler: LocationSampler,
    normalizer: GeometryNormalizer,
    scratch: ScratchDir,
    config: AcquisitionConfig,
}

impl AcquisitionController {
    pub fn new(config: AcquisitionConfig,
               archive: Box<dyn ArchiveClient>,
               stacker: Box<dyn ExposureStacker>,
               sampler: LocationSampler)
               -> Result<Self, CanonicalError> {
        config.validate()?;
        fs::create_dir_all(&config.output_dir).map_err(|e| internal_error(
            format!("Cannot create output dir {:?}: {:?}",
                    config.output_dir, e).as_str()))?;
        let scratch = ScratchDir::new(config.scratch_dir(), &config.image_extension)?;
        Ok(AcquisitionController{
            archive,
            stacker,
            sampler,
            normalizer: GeometryNormalizer::new(config.normalizer),
            scratch,
            config,
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Acquires `num_images` stacked images at distinct random locations.
    /// Locations that yield an image are added to `visited`.
    pub fn run(&mut self, num_images: usize, visited: &mut VisitedLocations)
               -> Result<RunSummary, CanonicalError> {
        let mut summary = RunSummary::default();
        self.discard_scratch();
        for image_num in 1..=num_images {
            let mut location = self.sampler.next(visited);
            let mut attempts = 0;
            loop {
                attempts += 1;
                if let Some(max_attempts) = self.config.max_attempts_per_image {
                    if attempts > max_attempts {
                        return Err(resource_exhausted_error(
                            format!("Gave up on image {} after {} attempts",
                                    image_num, max_attempts).as_str()));
                    }
                }
                info!("Image {} of {}: trying {}", image_num, num_images, location);
                let outcome = match self.fetch(&location) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.discard_scratch();
                        error!("Stopping run: {}", e.message);
                        return Err(e);
                    }
                };
                match outcome {
                    FetchOutcome::Success(path) => {
                        visited.insert(location);
                        info!("Saved {:?}", path);
                        summary.outputs.push(path);
                        break;
                    },
                    FetchOutcome::Retryable(e) => {
                        warn!("Retrying {}: {}", location, e.message);
                        self.discard_scratch();
                        summary.retries += 1;
                        if !self.config.retry_delay.is_zero() {
                            thread::sleep(self.config.retry_delay);
                        }
                    },
                    FetchOutcome::Abandon(e) => {
                        info!("Abandoning {}: {}", location, e.message);
                        self.discard_scratch();
                        summary.abandoned += 1;
                        location = self.sampler.next(visited);
                    },
                }
            }
        }
        info!("Run done: {} images, {} retries, {} locations abandoned",
              summary.outputs.len(), summary.retries, summary.abandoned);
        Ok(summary)
    }

    /// One attempt at producing the stacked image for `location`.
    pub fn fetch(&self, location: &CelestialLocation)
                 -> Result<FetchOutcome, CanonicalError> {
        match self.stack_location(location) {
            Ok(path) => Ok(FetchOutcome::Success(path)),
            Err(e) => classify(e),
        }
    }

    fn stack_location(&self, location: &CelestialLocation)
                      -> Result<PathBuf, CanonicalError> {
        let records = self.archive.query(location, self.config.search_radius_deg,
                                         self.config.product_type,
                                         &self.config.instrument)?;
        if records.is_empty() {
            return Err(not_found_error(
                format!("No exposures near {}", location).as_str()));
        }
        let groups = group_by_location(&records);
        let group = select_group(&groups, self.config.min_exposures)?;
        info!("Stacking {} exposures at {} ({:.3} deg from {}), {} groups found",
              group.len(), group.location,
              angular_separation(location, &group.location), location, groups.len());

        let mut cleanup = ExposureCleanup::new();
        for (n, url) in group.urls.iter().enumerate() {
            let path = self.scratch.exposure_path(n + 1);
            cleanup.track(path.clone());
            self.save_exposure(url, &path)?;
        }
        let stacked = self.stacker.stack(cleanup.paths()).map_err(|e| data_loss_error(
            format!("Stacking failed: {}", e.message).as_str()))?;
        drop(cleanup);

        let enhanced = equalize_histogram(&smooth(&stacked, self.config.smoothing_radius));
        let path = self.output_path(&group.location);
        enhanced.save(&path).map_err(|e| internal_error(
            format!("Cannot write {:?}: {:?}", path, e).as_str()))?;
        Ok(path)
    }

    // Downloads `url` to `path` and straightens it there.
    fn save_exposure(&self, url: &str, path: &Path) -> Result<(), CanonicalError> {
        let bytes = self.archive.download(url)?;
        fs::write(path, &bytes).map_err(|e| internal_error(
            format!("Cannot write {:?}: {:?}", path, e).as_str()))?;
        debug!("Downloaded {} bytes to {:?}", bytes.len(), path);
        self.normalizer.straighten_file(path)
    }

    fn output_path(&self, location: &CelestialLocation) -> PathBuf {
        self.config.output_dir.join(output_file_name(location, &self.config.image_extension))
    }

    fn discard_scratch(&self) {
        if let Err(e) = self.scratch.remove_exposures() {
            warn!("Cannot clear scratch files: {}", e.message);
        }
    }

    // Repeats `op` while it fails transiently, within the attempt budget.
    fn with_retries<T>(&self, what: &str,
                       mut op: impl FnMut() -> Result<T, CanonicalError>)
                       -> Result<T, CanonicalError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match op() {
                Ok(value) => { return Ok(value); },
                Err(e) => e,
            };
            if !is_transient(&err) {
                return Err(err);
            }
            if let Some(max_attempts) = self.config.max_attempts_per_image {
                if attempts >= max_attempts {
                    return Err(resource_exhausted_error(
                        format!("Gave up on {} after {} attempts: {}",
                                what, attempts, err.message).as_str()));
                }
            }
            warn!("Retrying {}: {}", what, err.message);
            if !self.config.retry_delay.is_zero() {
                thread::sleep(self.config.retry_delay);
            }
        }
    }

    /// Saves and straightens one exposure for every location the archive
    /// knows of for `product`. Returns the paths written.
    pub fn all_sky_survey(&self, product: ProductType)
                          -> Result<Vec<PathBuf>, CanonicalError> {
        let all_sky = CelestialLocation::new(0.0, 0.0);
        let records = self.with_retries("all-sky query", || {
            self.archive.query(&all_sky, 180.0, product, &self.config.instrument)
        })?;
        let groups = group_by_location(&records);
        info!("All-sky query found {} locations", groups.len());

        let mut outputs = Vec::new();
        for (n, group) in groups.iter().enumerate() {
            let Some(url) = group.urls.first() else { continue; };
            let path = self.output_path(&group.location);
            info!("Saving image {} of {} at {}", n + 1, groups.len(), group.location);
            let what = format!("download at {}", group.location);
            match self.with_retries(&what, || self.save_exposure(url, &path)) {
                Ok(()) => outputs.push(path),
                Err(e) if e.code == CanonicalErrorCode::InvalidArgument => { return Err(e); },
                Err(e) => {
                    warn!("Skipping {}: {}", group.location, e.message);
                    remove_partial(&path);
                },
            }
        }
        Ok(outputs)
    }

    fn save_combined(&self, location: &CelestialLocation, product: ProductType)
                     -> Result<PathBuf, CanonicalError> {
        let records = self.archive.query(location, self.config.search_radius_deg,
                                         product, &self.config.instrument)?;
        let groups = group_by_location(&records);
        let group = groups.first().ok_or_else(|| not_found_error(
            format!("No {} products near {}", product, location).as_str()))?;
        let path = self.output_path(&group.location);
        if let Err(e) = self.save_exposure(&group.urls[0], &path) {
            remove_partial(&path);
            return Err(e);
        }
        Ok(path)
    }

    /// Fetches an already-combined product near `location` instead of
    /// stacking exposures.
    pub fn fetch_combined(&self, location: &CelestialLocation, product: ProductType)
                          -> Result<FetchOutcome, CanonicalError> {
        let result = self.save_combined(location, product);
        match result {
            Ok(path) => Ok(FetchOutcome::Success(path)),
            Err(e) => classify(e),
        }
    }
}

// Removes an output file left behind by a failed save.
fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Cannot remove {:?}: {:?}", path, e);
        }
    }
}

// mod tests.
