//! Parameter distributions sampled and refitted by the CEM metaoptimizer.
//!
//! Numerical parameters are drawn from (log-)normal distributions truncated
//! to their bounds; discrete parameters are drawn from a reweighted option
//! set. After every iteration the distributions are refitted to the elite
//! configurations.

use std::collections::HashSet;

use anyhow::Result;
use rand::Rng;
use rand::distr::Distribution as _;
use rand::distr::weighted::WeightedIndex;
use rand_distr::StandardNormal;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::error::EngineError;
use crate::params::ParamValue;
use crate::params::check_valid_param_name;
use crate::settings::DistributionSpec;

/// The smallest number of elite values a refit is based on.
///
/// Refitting on fewer samples would be dominated by noise.
const MIN_POINTS_FOR_FIT: usize = 5;

/// A distribution over one (possibly dotted) parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// A truncated (log-)normal distribution over a numerical parameter.
    Numerical(NumericalDistribution),
    /// A reweighted choice over a fixed option set.
    Discrete(DiscreteDistribution),
}

impl Distribution {
    /// Builds a distribution from its settings-file description.
    pub fn from_spec(spec: &DistributionSpec) -> Result<Self> {
        check_valid_param_name(&spec.param)?;

        match spec.distribution.as_str() {
            "TruncatedNormal" => NumericalDistribution::new(spec, false, false),
            "TruncatedLogNormal" => NumericalDistribution::new(spec, true, false),
            "IntNormal" => NumericalDistribution::new(spec, false, true),
            "IntLogNormal" => NumericalDistribution::new(spec, true, true),
            "Discrete" => DiscreteDistribution::new(spec),
            other => Err(EngineError::Settings(format!(
                "distribution `{other}` does not exist"
            ))
            .into()),
        }
    }

    /// The flattened name of the parameter this distribution samples.
    pub fn param_name(&self) -> &str {
        match self {
            Self::Numerical(d) => &d.param_name,
            Self::Discrete(d) => &d.param_name,
        }
    }

    /// Refits the distribution to the given elite values.
    pub fn fit(&mut self, values: &[ParamValue]) {
        match self {
            Self::Numerical(d) => d.fit(values),
            Self::Discrete(d) => d.fit(values),
        }
    }

    /// Draws a fresh batch of samples to be handed out by [`Self::sample`].
    pub fn prepare_samples(&mut self, howmany: usize) {
        match self {
            Self::Numerical(d) => d.prepare_samples(howmany),
            Self::Discrete(d) => d.prepare_samples(howmany),
        }
    }

    /// Hands out the next prepared sample.
    pub fn sample(&mut self) -> ParamValue {
        match self {
            Self::Numerical(d) => d.sample(),
            Self::Discrete(d) => d.sample(),
        }
    }
}

/// A truncated (log-)normal distribution over a numerical parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericalDistribution {
    /// The flattened parameter name.
    param_name: String,
    /// The lower bound of the parameter.
    lower: f64,
    /// The upper bound of the parameter.
    upper: f64,
    /// Whether the distribution lives in log space.
    log_space: bool,
    /// Whether samples are rounded to integers.
    integer: bool,
    /// Whether samples are rounded to few significant digits.
    smart_rounding: bool,
    /// The current mean (in log space when `log_space` is set).
    mean: f64,
    /// The current standard deviation (in log space when `log_space` is
    /// set).
    std: f64,
    /// The mean before the last refit, for the momentum term.
    last_mean: Option<f64>,
    /// The prepared sample batch.
    #[serde(skip)]
    samples: Vec<f64>,
    /// How many prepared samples were handed out.
    #[serde(skip)]
    cursor: usize,
}

impl NumericalDistribution {
    /// Builds the distribution from its spec.
    fn new(spec: &DistributionSpec, log_space: bool, integer: bool) -> Result<Distribution> {
        let [lower, upper] = spec.bounds.ok_or_else(|| {
            EngineError::Settings(format!(
                "distribution for `{param}` requires `bounds`",
                param = spec.param
            ))
        })?;
        if lower >= upper {
            return Err(EngineError::Settings(format!(
                "bounds for `{param}` don't yield a proper interval",
                param = spec.param
            ))
            .into());
        }
        if log_space && lower < 1e-10 {
            return Err(EngineError::Settings(format!(
                "bounds for `{param}` must be positive",
                param = spec.param
            ))
            .into());
        }
        if integer && (lower.fract() != 0.0 || upper.fract() != 0.0) {
            return Err(EngineError::Settings(format!(
                "bounds for integer distribution `{param}` must be integral",
                param = spec.param
            ))
            .into());
        }

        let (space_lower, space_upper) = if log_space {
            (lower.ln(), upper.ln())
        } else {
            (lower, upper)
        };
        Ok(Distribution::Numerical(Self {
            param_name: spec.param.clone(),
            lower,
            upper,
            log_space,
            integer,
            smart_rounding: true,
            mean: 0.5 * (space_lower + space_upper),
            std: (space_upper - space_lower) / 4.0,
            last_mean: None,
            samples: Vec::new(),
            cursor: 0,
        }))
    }

    /// The bounds of the space the mean and std live in.
    fn space_bounds(&self) -> (f64, f64) {
        if self.log_space {
            (self.lower.ln(), self.upper.ln())
        } else {
            (self.lower, self.upper)
        }
    }

    /// Refits mean and standard deviation to the elite values.
    fn fit(&mut self, values: &[ParamValue]) {
        let mut data: Vec<f64> = values.iter().filter_map(ParamValue::as_f64).collect();
        if data.len() < MIN_POINTS_FOR_FIT {
            // Do not refit based on too few samples.
            return;
        }
        if self.log_space {
            data = data.into_iter().map(f64::ln).collect();
        }

        let new_mean = data.iter().sum::<f64>() / data.len() as f64;
        let variance = data.iter().map(|v| (v - new_mean).powi(2)).sum::<f64>() / data.len() as f64;
        self.std = variance.sqrt();

        if (new_mean - self.mean).abs() > 1e-3 {
            self.last_mean = Some(self.mean);
        }
        self.mean = new_mean;

        let (lower, upper) = self.space_bounds();
        if !(lower <= self.mean && self.mean <= upper) {
            warn!("mean of {param} is out of bounds", param = self.param_name);
        }
    }

    /// Draws a fresh batch of samples.
    fn prepare_samples(&mut self, howmany: usize) {
        // Smart rounding needs a reasonable sample size to judge how much
        // precision the batch actually uses.
        let howmany = howmany.max(10);

        // A momentum term pushes the mean into the direction of the last
        // refit.
        let (lower, upper) = self.space_bounds();
        let mean_to_use = match self.last_mean {
            Some(last) => {
                let extrapolated = 4.0 * self.mean - 3.0 * last;
                if lower <= extrapolated && extrapolated <= upper {
                    extrapolated
                } else {
                    self.mean
                }
            }
            None => self.mean,
        };

        let mut rng = rand::rng();
        let mut samples: Vec<f64> = (0..howmany)
            .map(|_| {
                let normal: f64 = rng.sample(StandardNormal);
                let value = normal * self.std + mean_to_use;
                if self.log_space { value.exp() } else { value }
            })
            .collect();

        if self.smart_rounding {
            samples = smart_round(&samples);
        }
        for sample in &mut samples {
            *sample = sample.clamp(self.lower, self.upper);
            if self.integer {
                *sample = (*sample + 0.5).floor();
            }
        }

        self.samples = samples;
        self.cursor = 0;
    }

    /// Hands out the next prepared sample.
    fn sample(&mut self) -> ParamValue {
        let value = self.samples[self.cursor % self.samples.len()];
        self.cursor += 1;
        if self.integer {
            ParamValue::Int(value as i64)
        } else {
            ParamValue::Float(value)
        }
    }
}

/// A reweighted choice over a fixed option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteDistribution {
    /// The flattened parameter name.
    param_name: String,
    /// The options the parameter is drawn from.
    options: Vec<ParamValue>,
    /// The current probability of each option.
    probs: Vec<f64>,
    /// The prepared sample batch.
    #[serde(skip)]
    samples: Vec<ParamValue>,
    /// How many prepared samples were handed out.
    #[serde(skip)]
    cursor: usize,
}

impl DiscreteDistribution {
    /// Builds the distribution from its spec.
    fn new(spec: &DistributionSpec) -> Result<Distribution> {
        let options = spec.options.clone().ok_or_else(|| {
            EngineError::Settings(format!(
                "discrete distribution for `{param}` requires `options`",
                param = spec.param
            ))
        })?;
        if options.is_empty() {
            return Err(EngineError::Settings(format!(
                "discrete distribution for `{param}` has no options",
                param = spec.param
            ))
            .into());
        }

        let probs = vec![1.0 / options.len() as f64; options.len()];
        Ok(Distribution::Discrete(Self {
            param_name: spec.param.clone(),
            options,
            probs,
            samples: Vec::new(),
            cursor: 0,
        }))
    }

    /// Reweights the options towards the frequencies in the elite values.
    ///
    /// Every option keeps a pseudo-count of one so that none is ruled out
    /// entirely.
    fn fit(&mut self, values: &[ParamValue]) {
        // Values coming back from result tables may have lost their exact
        // type (e.g. integers read back from CSV), so compare string forms.
        let frequencies: Vec<usize> = self
            .options
            .iter()
            .map(|option| {
                let key = option.to_string();
                values.iter().filter(|v| v.to_string() == key).count()
            })
            .collect();

        let denominator = (values.len() + self.options.len()) as f64;
        self.probs = frequencies
            .iter()
            .map(|freq| (1.0 + *freq as f64) / denominator)
            .collect();

        let sum: f64 = self.probs.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            warn!(
                "probabilities of `{param}` do not sum up to one",
                param = self.param_name
            );
            for prob in &mut self.probs {
                *prob /= sum;
            }
        }
    }

    /// Draws a fresh batch of samples.
    fn prepare_samples(&mut self, howmany: usize) {
        let howmany = howmany.max(1);
        let mut rng = rand::rng();
        let index = WeightedIndex::new(&self.probs).expect("probabilities should be valid");
        self.samples = (0..howmany)
            .map(|_| self.options[index.sample(&mut rng)].clone())
            .collect();
        self.cursor = 0;
    }

    /// Hands out the next prepared sample.
    fn sample(&mut self) -> ParamValue {
        let value = self.samples[self.cursor % self.samples.len()].clone();
        self.cursor += 1;
        value
    }
}

/// Rounds a value to the given number of significant digits.
fn round_to_significant_digits(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor();
    let factor = 10f64.powf(digits as f64 - 1.0 - magnitude);
    (value * factor).round() / factor
}

/// Counts the distinct values in a sample set.
fn distinct(samples: &[f64]) -> usize {
    samples
        .iter()
        .map(|v| v.to_bits())
        .collect::<HashSet<_>>()
        .len()
}

/// Rounds samples to the fewest significant digits that keep the sample set
/// shattered enough.
///
/// A rounding is accepted when it keeps at least half of the distinct
/// values distinct. Falls back to the unrounded samples when even five
/// digits lose too much.
fn smart_round(samples: &[f64]) -> Vec<f64> {
    let original_distinct = distinct(samples);
    for digits in 1..=5 {
        let rounded: Vec<f64> = samples
            .iter()
            .map(|v| round_to_significant_digits(*v, digits))
            .collect();
        if distinct(&rounded) * 2 >= original_distinct {
            return rounded;
        }
    }
    samples.to_vec()
}
