/// Fitting parameters. Every field has a documented default; `validate` rejects
/// out-of-range values before any fitting begins.

use serde::{Deserialize, Serialize};

use crate::error::{invalid, Result};

/// Which outer control loop runs the shared subroutines.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum Pipeline {
    #[default]
    Batch,
    Online,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CnmfConfig {
    pub pipeline: Pipeline,
    pub preprocess: PreprocessConfig,
    pub init: InitConfig,
    pub spatial: SpatialConfig,
    pub temporal: TemporalConfig,
    pub merge: MergeConfig,
    pub quality: QualityConfig,
    /// Patch decomposition; `None` fits the whole field of view at once.
    pub patches: Option<PatchConfig>,
    pub online: OnlineConfig,
    /// Cap on spatial/temporal alternations. Default 4.
    pub max_iterations: usize,
    /// Relative residual change below which the loop stops. Default 1e-3.
    pub tolerance: f64,
    /// Seed for the background initializer. Default 0.
    pub seed: u64,
}

impl Default for CnmfConfig {
    fn default() -> Self {
        CnmfConfig {
            pipeline: Pipeline::Batch,
            preprocess: PreprocessConfig::default(),
            init: InitConfig::default(),
            spatial: SpatialConfig::default(),
            temporal: TemporalConfig::default(),
            merge: MergeConfig::default(),
            quality: QualityConfig::default(),
            patches: None,
            online: OnlineConfig::default(),
            max_iterations: 4,
            tolerance: 1e-3,
            seed: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NoiseMethod {
    Mean,
    Median,
    LogMeanExp,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ArOrder {
    /// Pick 1 or 2 from the data.
    Auto,
    Fixed(usize),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Frequency band (fraction of the sampling rate) averaged for noise. Default (0.25, 0.5).
    pub noise_range: (f64, f64),
    /// Default `LogMeanExp`.
    pub noise_method: NoiseMethod,
    /// Default `Fixed(1)`.
    pub ar_order: ArOrder,
    /// Extra autocovariance lags in the AR fit. Default 5.
    pub lags: usize,
    /// Shrinkage applied to AR roots. Default 0.96.
    pub fudge_factor: f64,
    /// Frames used for the periodogram. Default 3072.
    pub max_frames: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            noise_range: (0.25, 0.5),
            noise_method: NoiseMethod::LogMeanExp,
            ar_order: ArOrder::Fixed(1),
            lags: 5,
            fudge_factor: 0.96,
            max_frames: 3072,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Target number of components. Default 30.
    pub components: usize,
    /// Gaussian smoothing sigma in pixels (expected half-size of a source). Default 2.0.
    pub gsig: f64,
    /// Half-width of the extraction window. Default 6.
    pub window_radius: usize,
    /// Minimum distance between accepted centres, pixels. Default 3.0.
    pub min_distance: f64,
    /// Pixels whose trace correlates below this with the extracted trace are
    /// left out of the stored footprint. In [0, 1]. Default 0.1.
    pub min_corr: f64,
    /// Stop once the peak smoothed residual std falls below this many noise stds. Default 3.0.
    pub min_peak_snr: f64,
    /// Alternations of the local rank-1 factorization. Default 10.
    pub nmf_iterations: usize,
    /// Background rank. Default 1.
    pub background_components: usize,
}

impl Default for InitConfig {
    fn default() -> Self {
        InitConfig {
            components: 30,
            gsig: 2.0,
            window_radius: 6,
            min_distance: 3.0,
            min_corr: 0.1,
            min_peak_snr: 3.0,
            nmf_iterations: 10,
            background_components: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Dilation of the current support that forms the candidate mask. Default 2.
    pub dilation_radius: usize,
    /// Coordinate-descent sweeps of each per-pixel NNLS. Default 50.
    pub nnls_iterations: usize,
    /// Footprints with fewer non-zero pixels are degenerate. Default 3.
    pub min_pixels: usize,
    /// Keep only the connected region containing each footprint's peak. Default true.
    pub keep_largest_region: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        SpatialConfig {
            dilation_radius: 2,
            nnls_iterations: 50,
            min_pixels: 3,
            keep_largest_region: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// HALS sweeps per temporal update. Default 2.
    pub iterations: usize,
    /// Run OASIS on each trace; otherwise traces are only clipped at zero. Default true.
    pub deconvolve: bool,
    /// Fixed sparsity penalty; `None` calibrates it against the noise level. Default None.
    pub penalty: Option<f64>,
    /// Minimum spike size. Default 0.
    pub s_min: f64,
    /// Constrain the trace baseline to be non-negative. Default true.
    pub baseline_nonneg: bool,
    /// Re-estimate AR coefficients per trace instead of using the global ones. Default true.
    pub optimize_g: bool,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        TemporalConfig {
            iterations: 2,
            deconvolve: true,
            penalty: None,
            s_min: 0.0,
            baseline_nonneg: true,
            optimize_g: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum trace correlation. In [0, 1]. Default 0.85.
    pub correlation_threshold: f64,
    /// Minimum shared support over the smaller support. In [0, 1]. Default 0.1.
    pub overlap_threshold: f64,
    /// Detection/fusion rounds before giving up on a fixed point. Default 10.
    pub max_iterations: usize,
    /// Alternations of the rank-1 fusion. Default 10.
    pub fusion_iterations: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            correlation_threshold: 0.85,
            overlap_threshold: 0.1,
            max_iterations: 10,
            fusion_iterations: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Reject components failing both tests below. Default true.
    pub enabled: bool,
    /// Peak of the denoised trace over trace noise. Default 2.5.
    pub min_snr: f64,
    /// Correlation between footprint and data during active frames. In [-1, 1]. Default 0.8.
    pub min_spatial_corr: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            enabled: true,
            min_snr: 2.5,
            min_spatial_corr: 0.8,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum OwnershipPolicy {
    /// Patch with the higher median component SNR; ties by nearest patch centre.
    HighestQuality,
    /// Patch whose centre is closest to the pixel.
    NearestCenter,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Patch side in pixels. Default 32.
    pub size: usize,
    /// Overlap between neighbouring patches. Default 8.
    pub overlap: usize,
    /// Target components per patch. Default 10.
    pub components_per_patch: usize,
    pub ownership: OwnershipPolicy,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            size: 32,
            overlap: 8,
            components_per_patch: 10,
            ownership: OwnershipPolicy::HighestQuality,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// Periodic footprint refresh runs on the frame thread.
    Inline,
    /// Refresh runs on a rayon worker and is applied between frames.
    Offload { block_on_overlap: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Frames buffered before the first batch fit. Default 200.
    pub init_batch: usize,
    /// Alternations run on the initial buffer. Default 2.
    pub init_iterations: usize,
    /// Footprint refresh period K, frames. Default 50.
    pub refresh_every: usize,
    /// New-component trigger period M, frames. Default 20.
    pub trigger_every: usize,
    /// Merge pass period N, frames. Default 200.
    pub merge_every: usize,
    /// Residual frames examined by the trigger. Default 10.
    pub trigger_window: usize,
    /// Residual z-score that makes a pixel a candidate. Default 4.0.
    pub trigger_threshold: f64,
    /// Fraction of window frames that must exceed the threshold. In [0, 1]. Default 0.6.
    pub sustain_fraction: f64,
    /// Components added per trigger evaluation. Default 2.
    pub max_new_per_trigger: usize,
    /// Coordinate-descent sweeps of the per-frame projection. Default 5.
    pub hals_iterations: usize,
    /// Observations kept in each component's deconvolution ring. Default 64.
    pub state_capacity: usize,
    /// Consecutive silent frames before a component is rejected. Default 1000.
    pub reject_window: usize,
    /// Silence threshold, in units of the component's trace noise. Default 0.1.
    pub reject_amplitude: f64,
    /// Merge only pairs whose centroids are closer than this, pixels. Default 10.0.
    pub merge_proximity: f64,
    /// Trailing frames the merge correlation is computed over. Default 500.
    pub merge_window: usize,
    /// Publish a snapshot to the shared handle every this many frames; 0 disables. Default 0.
    pub publish_every: usize,
    pub background: BackgroundMode,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        OnlineConfig {
            init_batch: 200,
            init_iterations: 2,
            refresh_every: 50,
            trigger_every: 20,
            merge_every: 200,
            trigger_window: 10,
            trigger_threshold: 4.0,
            sustain_fraction: 0.6,
            max_new_per_trigger: 2,
            hals_iterations: 5,
            state_capacity: 64,
            reject_window: 1000,
            reject_amplitude: 0.1,
            merge_proximity: 10.0,
            merge_window: 500,
            publish_every: 0,
            background: BackgroundMode::Inline,
        }
    }
}

fn unit(param: &'static str, v: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&v) {
        return Err(invalid(param, format!("must be in [0, 1], got {v}")));
    }
    Ok(())
}

fn positive(param: &'static str, v: usize) -> Result<()> {
    if v == 0 {
        return Err(invalid(param, "must be a positive integer"));
    }
    Ok(())
}

fn finite_positive(param: &'static str, v: f64) -> Result<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(invalid(param, format!("must be finite and > 0, got {v}")));
    }
    Ok(())
}

impl CnmfConfig {
    /// Check every parameter range. Called by the pipelines before fitting.
    pub fn validate(&self) -> Result<()> {
        let pre = &self.preprocess;
        let (lo, hi) = pre.noise_range;
        if !(0.0..=0.5).contains(&lo) || !(0.0..=0.5).contains(&hi) || lo >= hi {
            return Err(invalid(
                "preprocess.noise_range",
                format!("must satisfy 0 <= lo < hi <= 0.5, got ({lo}, {hi})"),
            ));
        }
        if let ArOrder::Fixed(p) = pre.ar_order {
            if p != 1 && p != 2 {
                return Err(invalid("preprocess.ar_order", format!("must be 1 or 2, got {p}")));
            }
        }
        unit("preprocess.fudge_factor", pre.fudge_factor)?;
        positive("preprocess.max_frames", pre.max_frames)?;

        let init = &self.init;
        positive("init.components", init.components)?;
        finite_positive("init.gsig", init.gsig)?;
        positive("init.window_radius", init.window_radius)?;
        if !init.min_distance.is_finite() || init.min_distance < 0.0 {
            return Err(invalid("init.min_distance", "must be finite and >= 0"));
        }
        unit("init.min_corr", init.min_corr)?;
        if !init.min_peak_snr.is_finite() || init.min_peak_snr < 0.0 {
            return Err(invalid("init.min_peak_snr", "must be finite and >= 0"));
        }
        positive("init.nmf_iterations", init.nmf_iterations)?;
        positive("init.background_components", init.background_components)?;

        positive("spatial.nnls_iterations", self.spatial.nnls_iterations)?;
        positive("spatial.min_pixels", self.spatial.min_pixels)?;

        positive("temporal.iterations", self.temporal.iterations)?;
        if let Some(lambda) = self.temporal.penalty {
            if !lambda.is_finite() || lambda < 0.0 {
                return Err(invalid("temporal.penalty", "must be finite and >= 0"));
            }
        }
        if !self.temporal.s_min.is_finite() || self.temporal.s_min < 0.0 {
            return Err(invalid("temporal.s_min", "must be finite and >= 0"));
        }

        unit("merge.correlation_threshold", self.merge.correlation_threshold)?;
        unit("merge.overlap_threshold", self.merge.overlap_threshold)?;
        positive("merge.max_iterations", self.merge.max_iterations)?;
        positive("merge.fusion_iterations", self.merge.fusion_iterations)?;

        if !self.quality.min_snr.is_finite() || self.quality.min_snr < 0.0 {
            return Err(invalid("quality.min_snr", "must be finite and >= 0"));
        }
        if !(-1.0..=1.0).contains(&self.quality.min_spatial_corr) {
            return Err(invalid("quality.min_spatial_corr", "must be in [-1, 1]"));
        }

        if let Some(patches) = &self.patches {
            positive("patches.size", patches.size)?;
            positive("patches.components_per_patch", patches.components_per_patch)?;
            if patches.overlap >= patches.size {
                return Err(invalid(
                    "patches.overlap",
                    format!("must be smaller than size {}", patches.size),
                ));
            }
        }

        positive("max_iterations", self.max_iterations)?;
        finite_positive("tolerance", self.tolerance)?;

        if self.pipeline == Pipeline::Online {
            let on = &self.online;
            if on.init_batch < 2 {
                return Err(invalid("online.init_batch", "needs at least 2 frames"));
            }
            positive("online.init_iterations", on.init_iterations)?;
            positive("online.refresh_every", on.refresh_every)?;
            positive("online.trigger_every", on.trigger_every)?;
            positive("online.merge_every", on.merge_every)?;
            positive("online.trigger_window", on.trigger_window)?;
            finite_positive("online.trigger_threshold", on.trigger_threshold)?;
            unit("online.sustain_fraction", on.sustain_fraction)?;
            positive("online.hals_iterations", on.hals_iterations)?;
            if on.state_capacity < 4 {
                return Err(invalid("online.state_capacity", "must be at least 4"));
            }
            positive("online.reject_window", on.reject_window)?;
            if !on.reject_amplitude.is_finite() || on.reject_amplitude < 0.0 {
                return Err(invalid("online.reject_amplitude", "must be finite and >= 0"));
            }
            finite_positive("online.merge_proximity", on.merge_proximity)?;
            positive("online.merge_window", on.merge_window)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CnmfError;

    #[test]
    fn test_defaults_validate() {
        assert!(CnmfConfig::default().validate().is_ok());
        let online = CnmfConfig {
            pipeline: Pipeline::Online,
            ..CnmfConfig::default()
        };
        assert!(online.validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = CnmfConfig::default();
        config.merge.correlation_threshold = 1.5;
        match config.validate() {
            Err(CnmfError::InvalidConfig { param, .. }) => {
                assert_eq!(param, "merge.correlation_threshold")
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_window_rejected_only_online() {
        let mut config = CnmfConfig::default();
        config.online.trigger_every = 0;
        assert!(config.validate().is_ok());
        config.pipeline = Pipeline::Online;
        assert!(matches!(
            config.validate(),
            Err(CnmfError::InvalidConfig { param: "online.trigger_every", .. })
        ));
    }

    #[test]
    fn test_zero_merge_window_rejected() {
        let mut config = CnmfConfig::default();
        config.pipeline = Pipeline::Online;
        config.online.merge_window = 0;
        assert!(matches!(
            config.validate(),
            Err(CnmfError::InvalidConfig { param: "online.merge_window", .. })
        ));
    }

    #[test]
    fn test_patch_overlap_must_be_smaller() {
        let config = CnmfConfig {
            patches: Some(PatchConfig {
                size: 16,
                overlap: 16,
                ..PatchConfig::default()
            }),
            ..CnmfConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "init": { "components": 5 }, "merge": { "correlation_threshold": 0.7 } }"#;
        let config: CnmfConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.init.components, 5);
        assert_eq!(config.init.gsig, 2.0);
        assert_eq!(config.merge.correlation_threshold, 0.7);
        assert_eq!(config.merge.max_iterations, 10);
        assert!(config.validate().is_ok());
    }
}
