// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashSet;
use std::fmt;

use astro::angle::anglr_sepr;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

/// A position on the celestial sphere, in degrees. Right ascension is in
/// [0, 360), declination in [-90, 90].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CelestialLocation {
    pub ra: f64,
    pub dec: f64,
}

impl CelestialLocation {
    pub fn new(ra: f64, dec: f64) -> Self {
        CelestialLocation{ra, dec}
    }

    /// Rounds both coordinates to 3 decimal places, wrapping right ascension
    /// back into [0, 360) if rounding carried it to 360.
    pub fn rounded(ra: f64, dec: f64) -> Self {
        let ra = round_to_millis(ra).rem_euclid(360.0);
        let dec = round_to_millis(dec).clamp(-90.0, 90.0);
        CelestialLocation{ra, dec}
    }

    // Exact-value identity. Adding 0.0 folds -0.0 into +0.0 so that the two
    // zeros, which compare equal, also hash equal.
    fn key(&self) -> (u64, u64) {
        ((self.ra + 0.0).to_bits(), (self.dec + 0.0).to_bits())
    }
}

impl fmt::Display for CelestialLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RA:{}° DEC:{}°", self.ra, self.dec)
    }
}

fn round_to_millis(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Returns the separation, in degrees, between the given celestial locations.
pub fn angular_separation(p0: &CelestialLocation, p1: &CelestialLocation) -> f64 {
    anglr_sepr(p0.ra.to_radians(), p0.dec.to_radians(),
               p1.ra.to_radians(), p1.dec.to_radians()).to_degrees()
}

/// Locations already acquired during one run. Owned by the caller of
/// `LocationSampler::next()` and only grown once an acquisition succeeds.
#[derive(Debug, Default)]
pub struct VisitedLocations {
    keys: HashSet<(u64, u64)>,
}

impl VisitedLocations {
    pub fn new() -> Self {
        VisitedLocations{keys: HashSet::new()}
    }

    pub fn contains(&self, location: &CelestialLocation) -> bool {
        self.keys.contains(&location.key())
    }

    // Returns false if `location` was already present.
    pub fn insert(&mut self, location: CelestialLocation) -> bool {
        self.keys.insert(location.key())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Draws candidate sky locations uniformly over the sphere.
pub struct LocationSampler<R: Rng = StdRng> {
    rng: R,
}

impl LocationSampler<StdRng> {
    pub fn new() -> Self {
        LocationSampler{rng: StdRng::from_entropy()}
    }

    // Reproducible sequence, for tests and re-runs.
    pub fn with_seed(seed: u64) -> Self {
        LocationSampler{rng: StdRng::seed_from_u64(seed)}
    }
}

impl Default for LocationSampler<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> LocationSampler<R> {
    pub fn from_rng(rng: R) -> Self {
        LocationSampler{rng}
    }

    // One draw, without regard to previously visited locations. Declination
    // is asin() of a uniform variate so that points do not bunch up at the
    // poles.
    fn draw(&mut self) -> CelestialLocation {
        let ra = self.rng.gen_range(0.0..360.0);
        let dec = self.rng.gen_range(-1.0..=1.0_f64).asin().to_degrees();
        CelestialLocation::rounded(ra, dec)
    }

    /// Returns a location that is not in `visited`. Does not add it; the
    /// caller commits the location once it has been fully processed.
    pub fn next(&mut self, visited: &VisitedLocations) -> CelestialLocation {
        loop {
            let candidate = self.draw();
            if !visited.contains(&candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_rounded() {
        let loc = CelestialLocation::rounded(83.82214, -5.39111);
        assert_eq!(loc, CelestialLocation::new(83.822, -5.391));

        // Rounding up to 360 wraps to 0.
        let loc = CelestialLocation::rounded(359.9996, 12.0);
        assert_eq!(loc.ra, 0.0);
    }

    #[test]
    fn test_visited_locations() {
        let mut visited = VisitedLocations::new();
        assert!(visited.is_empty());
        assert!(visited.insert(CelestialLocation::new(10.5, -20.25)));
        assert!(!visited.insert(CelestialLocation::new(10.5, -20.25)));
        assert!(visited.contains(&CelestialLocation::new(10.5, -20.25)));
        assert!(!visited.contains(&CelestialLocation::new(10.5, -20.251)));

        // Signed zeros are the same location.
        visited.insert(CelestialLocation::new(0.0, 0.0));
        assert!(visited.contains(&CelestialLocation::new(-0.0, -0.0)));
        assert_eq!(visited.len(), 2);
    }

    #[test]
    fn test_sampled_ranges_and_uniqueness() {
        let mut sampler = LocationSampler::with_seed(7);
        let mut visited = VisitedLocations::new();
        for _ in 0..5000 {
            let loc = sampler.next(&visited);
            assert!(loc.ra >= 0.0 && loc.ra < 360.0, "ra {}", loc.ra);
            assert!(loc.dec >= -90.0 && loc.dec <= 90.0, "dec {}", loc.dec);
            assert_eq!(loc, CelestialLocation::rounded(loc.ra, loc.dec));
            assert!(visited.insert(loc), "repeated {}", loc);
        }
    }

    #[test]
    fn test_next_skips_visited() {
        // Two samplers with the same seed produce the same sequence; marking
        // the first draw visited makes the second sampler skip it.
        let mut reference = LocationSampler::with_seed(11);
        let first = reference.next(&VisitedLocations::new());
        let second = reference.next(&VisitedLocations::new());

        let mut visited = VisitedLocations::new();
        visited.insert(first);
        let mut sampler = LocationSampler::with_seed(11);
        assert_eq!(sampler.next(&visited), second);
    }

    #[test]
    fn test_declination_is_sphere_uniform() {
        let mut sampler = LocationSampler::with_seed(1234);
        let visited = VisitedLocations::new();
        let num_draws = 40000;
        let num_bins = 10;
        let mut sin_bins = vec![0_usize; num_bins];
        let mut dec_bins = vec![0_usize; num_bins];
        for _ in 0..num_draws {
            let loc = sampler.next(&visited);
            let s = loc.dec.to_radians().sin();
            let sin_bin = (((s + 1.0) / 2.0) * num_bins as f64) as usize;
            sin_bins[sin_bin.min(num_bins - 1)] += 1;
            let dec_bin = (((loc.dec + 90.0) / 180.0) * num_bins as f64) as usize;
            dec_bins[dec_bin.min(num_bins - 1)] += 1;
        }
        let expected = (num_draws / num_bins) as f64;
        for count in &sin_bins {
            assert_abs_diff_eq!(*count as f64 / expected, 1.0, epsilon = 0.1);
        }
        // Declination itself is not uniform: the polar bins are far emptier
        // than the equatorial ones.
        assert!((dec_bins[0] as f64) < 0.3 * dec_bins[num_bins / 2] as f64);
        assert!((dec_bins[num_bins - 1] as f64) < 0.3 * dec_bins[num_bins / 2] as f64);
    }

    #[test]
    fn test_angular_separation() {
        let p0 = CelestialLocation::new(180.0, 0.0);
        let p1 = CelestialLocation::new(180.0, 1.0);
        assert_abs_diff_eq!(angular_separation(&p0, &p1), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(angular_separation(&p0, &p0), 0.0, epsilon = 1e-9);

        let p2 = CelestialLocation::new(180.0 + 1.0_f64.to_degrees(), 1.0_f64.to_degrees());
        assert_abs_diff_eq!(angular_separation(&p0, &p2).to_radians(), 1.27,
                            epsilon = 0.01);

        // Across the RA wrap, and pole to pole.
        assert_abs_diff_eq!(angular_separation(&CelestialLocation::new(359.0, 0.0),
                                               &CelestialLocation::new(1.0, 0.0)),
                            2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(angular_separation(&CelestialLocation::new(0.0, 90.0),
                                               &CelestialLocation::new(0.0, -90.0)),
                            180.0, epsilon = 1e-6);
    }

}  // mod tests.
