//! Region-based point-sequence builder for non-uniform scans.
//!
//! Spectroscopic scans are defined as a list of regions, each with its own
//! point density and dwell policy. Regions append to one shared point array
//! (and a parallel dwell array) in call order; a global monotonicity
//! invariant is enforced by silently dropping any point that does not exceed
//! the maximum value already accumulated, so overlapping region edges never
//! produce a backwards step.
//!
//! Region bounds may be given in raw units, relative to an edge energy `e0`,
//! or in photoelectron wavenumber `k` (converted as `energy = e0 + k²·K2E`).

use anyhow::{anyhow, Result};
use std::time::Duration;

/// Conversion constant between photoelectron wavenumber squared and energy
/// above the edge, in eV·Å².
pub const K2E: f64 = 3.809_980_849_311_092;

/// Energy above the edge (eV) for a wavenumber `k` (Å⁻¹).
pub fn ktoe(k: f64) -> f64 {
    k * k * K2E
}

/// Wavenumber (Å⁻¹) for an energy above the edge (eV).
pub fn etok(energy: f64) -> f64 {
    (energy / K2E).max(0.0).sqrt()
}

/// Format a duration as `H:MM:SS` for progress messages.
pub fn hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// One contiguous sub-range of scan points with its own density and dwell
/// policy. Construct with [`Region::new`] and the builder methods, then
/// hand to [`RegionBuilder::add_region`].
#[derive(Clone, Debug)]
pub struct Region {
    start: f64,
    stop: f64,
    step: Option<f64>,
    npts: Option<usize>,
    relative: bool,
    use_k: bool,
    e0: Option<f64>,
    dtime: Option<f64>,
    dtime_final: Option<f64>,
    dtime_wt: f64,
}

impl Region {
    /// Region spanning `start..stop`. One of [`Region::step`] or
    /// [`Region::npts`] must be supplied before the region can be added.
    pub fn new(start: f64, stop: f64) -> Self {
        Self {
            start,
            stop,
            step: None,
            npts: None,
            relative: true,
            use_k: false,
            e0: None,
            dtime: None,
            dtime_final: None,
            dtime_wt: 1.0,
        }
    }

    /// Spacing between points. Point count becomes
    /// `1 + floor(|stop - start| / step + 0.1)`.
    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Explicit point count.
    pub fn npts(mut self, npts: usize) -> Self {
        self.npts = Some(npts);
        self
    }

    /// Interpret bounds relative to the edge energy (the default) or as
    /// absolute values.
    pub fn relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    /// Interpret bounds as wavenumber `k` and convert to energy.
    pub fn use_k(mut self) -> Self {
        self.use_k = true;
        self
    }

    /// Edge energy override for this region.
    pub fn e0(mut self, e0: f64) -> Self {
        self.e0 = Some(e0);
        self
    }

    /// Dwell time at the start of the region, in seconds.
    pub fn dwell(mut self, seconds: f64) -> Self {
        self.dtime = Some(seconds);
        self
    }

    /// Dwell time at the end of the region; dwell interpolates from
    /// [`Region::dwell`] following the weight power law.
    pub fn dwell_final(mut self, seconds: f64) -> Self {
        self.dtime_final = Some(seconds);
        self
    }

    /// Power-law exponent for dwell interpolation:
    /// `dwell[i] = dtime + (dtime_final - dtime) · (i / (npts-1))^weight`.
    pub fn dwell_weight(mut self, weight: f64) -> Self {
        self.dtime_wt = weight;
        self
    }
}

/// Accumulates regions into one monotonic point array and a parallel
/// per-point dwell array.
#[derive(Debug, Default)]
pub struct RegionBuilder {
    e0: f64,
    default_dwell: f64,
    points: Vec<f64>,
    dwelltimes: Vec<f64>,
    regions: usize,
}

impl RegionBuilder {
    /// Builder with edge energy 0 and a 1 s default dwell.
    pub fn new() -> Self {
        Self {
            e0: 0.0,
            default_dwell: 1.0,
            points: Vec::new(),
            dwelltimes: Vec::new(),
            regions: 0,
        }
    }

    /// Builder with the given edge energy.
    pub fn with_e0(e0: f64) -> Self {
        Self {
            e0,
            ..Self::new()
        }
    }

    /// Dwell used by regions that do not set their own.
    pub fn set_default_dwell(&mut self, seconds: f64) {
        self.default_dwell = seconds;
    }

    /// Append a region. Returns the number of points accepted after the
    /// monotonicity filter; dropped points are logged, not raised. Regions
    /// must therefore be added in order of increasing value.
    pub fn add_region(&mut self, region: Region) -> Result<usize> {
        let e0 = region.e0.unwrap_or(self.e0);
        if let Some(e0_override) = region.e0 {
            self.e0 = e0_override;
        }
        let dtime = region.dtime.unwrap_or(self.default_dwell);
        self.default_dwell = dtime;

        if !region.start.is_finite() || !region.stop.is_finite() {
            return Err(anyhow!("region bounds must be finite"));
        }
        let npts = match (region.npts, region.step) {
            (Some(n), _) => n,
            (None, Some(step)) => {
                if step == 0.0 || !step.is_finite() {
                    return Err(anyhow!("region step must be finite and non-zero"));
                }
                1 + ((region.stop - region.start).abs() / step + 0.1).floor() as usize
            }
            (None, None) => {
                return Err(anyhow!("region needs start, stop, and either step or npts"));
            }
        };
        if npts == 0 {
            return Err(anyhow!("region must contain at least one point"));
        }

        let mut values = linspace(region.start, region.stop, npts);
        if region.use_k {
            for v in &mut values {
                *v = e0 + ktoe(*v);
            }
        } else if region.relative {
            for v in &mut values {
                *v += e0;
            }
        }
        values.sort_by(|a, b| a.total_cmp(b));

        // every accepted point must exceed the maximum already accumulated
        let floor = self.points.last().copied();
        let offered = values.len();
        if let Some(floor) = floor {
            values.retain(|v| *v > floor);
        }
        let accepted = values.len();
        if accepted < offered {
            tracing::debug!(
                region = self.regions,
                dropped = offered - accepted,
                "dropped non-monotonic region points"
            );
        }

        let dwell = dwell_schedule(accepted, dtime, region.dtime_final, region.dtime_wt);
        self.points.extend(values);
        self.dwelltimes.extend(dwell);
        self.regions += 1;
        Ok(accepted)
    }

    /// The accumulated point array.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// The accumulated per-point dwell array, parallel to `points()`.
    pub fn dwelltimes(&self) -> &[f64] {
        &self.dwelltimes
    }

    /// Total accumulated points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True before any region was added.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of regions added.
    pub fn regions(&self) -> usize {
        self.regions
    }

    /// Rough scan duration: summed dwell plus a fixed per-point overhead.
    pub fn estimated_time(&self, overhead_per_point: Duration) -> Duration {
        let dwell: f64 = self.dwelltimes.iter().sum();
        Duration::from_secs_f64(dwell) + overhead_per_point * self.points.len() as u32
    }
}

fn linspace(start: f64, stop: f64, npts: usize) -> Vec<f64> {
    if npts == 1 {
        return vec![start];
    }
    let step = (stop - start) / (npts - 1) as f64;
    (0..npts).map(|i| start + step * i as f64).collect()
}

fn dwell_schedule(npts: usize, dtime: f64, dtime_final: Option<f64>, wt: f64) -> Vec<f64> {
    match dtime_final {
        Some(final_time) if wt > 0.0 && npts > 1 => {
            let span = final_time - dtime;
            (0..npts)
                .map(|i| dtime + span * (i as f64 / (npts - 1) as f64).powf(wt))
                .collect()
        }
        _ => vec![dtime; npts],
    }
}
