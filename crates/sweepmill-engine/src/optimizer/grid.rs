//! The grid search enumerator.
//!
//! Enumerates the Cartesian product of the configured value lists (or, when
//! `samples` is set, draws that many random combinations per pass) and
//! repeats the enumeration `restarts` times. There is no feedback: `tell`
//! is a no-op.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use rand::prelude::IndexedRandom;

use super::Optimizer;
use crate::error::EngineError;
use crate::job::Job;
use crate::params::ParamTree;
use crate::params::check_valid_param_name;
use crate::results::Table;
use crate::settings::HyperparamSpec;

/// The grid search enumerator.
#[derive(Debug)]
pub struct GridSearchOptimizer {
    /// The enumerated parameters and their value lists.
    hyperparams: Vec<HyperparamSpec>,
    /// Random draws per pass instead of full enumeration, when set.
    samples: Option<usize>,
    /// How many passes over the grid are made.
    restarts: usize,
    /// The number of completed passes.
    iteration: usize,
    /// The odometer over the value lists (full enumeration) or the number
    /// of draws handed out (sampling).
    cursor: Cursor,
    /// An empty table, for the [`Optimizer`] accessors.
    empty: Table,
}

/// The position inside one pass over the grid.
#[derive(Debug)]
enum Cursor {
    /// Odometer indices into the value lists; `None` once exhausted.
    Product(Option<Vec<usize>>),
    /// Number of random draws handed out this pass.
    Sampling(usize),
}

impl GridSearchOptimizer {
    /// Constructs the enumerator.
    ///
    /// With an empty hyperparameter list the grid degenerates to a single
    /// empty setting per pass (only restarts vary).
    pub fn new(
        hyperparams: Vec<HyperparamSpec>,
        samples: Option<usize>,
        restarts: usize,
    ) -> Result<Self> {
        for spec in &hyperparams {
            check_valid_param_name(&spec.param)?;
            if spec.values.is_empty() {
                return Err(EngineError::Settings(format!(
                    "hyperparameter `{param}` has an empty value list",
                    param = spec.param
                ))
                .into());
            }
        }
        if restarts == 0 {
            return Err(EngineError::Settings("restarts must be positive".to_string()).into());
        }

        let cursor = match samples {
            Some(_) => Cursor::Sampling(0),
            None => Cursor::Product(Some(vec![0; hyperparams.len()])),
        };
        Ok(Self {
            hyperparams,
            samples,
            restarts,
            iteration: 0,
            cursor,
            empty: Table::new(),
        })
    }

    /// Collects every remaining setting of the run.
    pub fn ask_all(&mut self) -> Vec<ParamTree> {
        let mut settings = Vec::new();
        while let Some(setting) = self.ask() {
            settings.push(setting);
        }
        settings
    }

    /// Resets the cursor for the next pass.
    fn reset_pass(&mut self) {
        self.cursor = match self.samples {
            Some(_) => Cursor::Sampling(0),
            None => Cursor::Product(Some(vec![0; self.hyperparams.len()])),
        };
    }

    /// Produces the next setting of the current pass, if any.
    fn next_in_pass(&mut self) -> Option<ParamTree> {
        match &mut self.cursor {
            Cursor::Product(indices) => {
                let current = indices.as_mut()?;
                let setting = ParamTree::from_flat(
                    self.hyperparams
                        .iter()
                        .zip(current.iter())
                        .map(|(spec, index)| (spec.param.clone(), spec.values[*index].clone())),
                );

                // Advance the odometer; carry overflow into the next digit.
                let mut exhausted = true;
                for (digit, spec) in current.iter_mut().zip(&self.hyperparams).rev() {
                    *digit += 1;
                    if *digit < spec.values.len() {
                        exhausted = false;
                        break;
                    }
                    *digit = 0;
                }
                if exhausted {
                    *indices = None;
                }
                Some(setting)
            }
            Cursor::Sampling(drawn) => {
                let samples = self.samples.expect("sampling cursor implies samples");
                if *drawn >= samples {
                    return None;
                }
                *drawn += 1;
                let mut rng = rand::rng();
                Some(ParamTree::from_flat(self.hyperparams.iter().map(|spec| {
                    (
                        spec.param.clone(),
                        spec.values
                            .choose(&mut rng)
                            .expect("value lists are non-empty")
                            .clone(),
                    )
                })))
            }
        }
    }
}

impl Optimizer for GridSearchOptimizer {
    fn ask(&mut self) -> Option<ParamTree> {
        if let Some(setting) = self.next_in_pass() {
            return Some(setting);
        }
        self.iteration += 1;
        if self.iteration >= self.restarts {
            return None;
        }
        self.reset_pass();
        self.next_in_pass()
    }

    fn tell(&mut self, jobs: Vec<&mut Job>) -> Result<()> {
        // Grid search is not refitted; results are collected by the
        // orchestrator directly.
        for job in jobs {
            job.results_used_for_update = true;
        }
        Ok(())
    }

    fn iteration(&self) -> usize {
        self.iteration
    }

    fn advance_iteration(&mut self) {
        self.iteration += 1;
    }

    fn full_df(&self) -> &Table {
        &self.empty
    }

    fn minimal_df(&self) -> &Table {
        &self.empty
    }

    fn metric_to_optimize(&self) -> Option<&str> {
        None
    }

    fn minimize(&self) -> bool {
        false
    }

    fn save_data_and_self(&self, _directory: &Path) -> Result<()> {
        // The grid has no state worth snapshotting.
        Ok(())
    }

    fn best_jobs_working_dirs(&self, _how_many: usize) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::params::ParamValue;

    /// Builds a spec over integer values.
    fn spec(param: &str, values: &[i64]) -> HyperparamSpec {
        HyperparamSpec {
            param: param.to_string(),
            values: values.iter().map(|v| ParamValue::Int(*v)).collect(),
        }
    }

    #[test]
    fn enumerates_cartesian_product() {
        let mut optimizer =
            GridSearchOptimizer::new(vec![spec("x", &[0, 1]), spec("y", &[10, 20])], None, 1)
                .unwrap();
        let settings = optimizer.ask_all();
        assert_eq!(settings.len(), 4);

        let pairs: Vec<(i64, i64)> = settings
            .iter()
            .map(|s| {
                let x = s.get_path("x").unwrap().as_f64().unwrap() as i64;
                let y = s.get_path("y").unwrap().as_f64().unwrap() as i64;
                (x, y)
            })
            .collect();
        assert_eq!(pairs, [(0, 10), (0, 20), (1, 10), (1, 20)]);
        assert!(optimizer.ask().is_none());
    }

    #[test]
    fn restarts_repeat_the_grid() {
        let mut optimizer = GridSearchOptimizer::new(vec![spec("x", &[0, 1])], None, 3).unwrap();
        assert_eq!(optimizer.ask_all().len(), 6);
    }

    #[test]
    fn sampling_short_circuits_enumeration() {
        let mut optimizer = GridSearchOptimizer::new(
            vec![spec("x", &[0, 1, 2]), spec("y", &[0, 1, 2])],
            Some(4),
            2,
        )
        .unwrap();
        let settings = optimizer.ask_all();
        assert_eq!(settings.len(), 8);
        for setting in settings {
            let x = setting.get_path("x").unwrap().as_f64().unwrap();
            assert!((0.0..=2.0).contains(&x));
        }
    }

    #[test]
    fn empty_grid_runs_only_restarts() {
        let mut optimizer = GridSearchOptimizer::new(Vec::new(), None, 2).unwrap();
        let settings = optimizer.ask_all();
        assert_eq!(settings.len(), 2);
        assert!(settings.iter().all(ParamTree::is_empty));
    }

    #[test]
    fn dotted_params_become_nested_settings() {
        let mut optimizer =
            GridSearchOptimizer::new(vec![spec("model.width", &[64, 128])], None, 1).unwrap();
        let setting = optimizer.ask().unwrap();
        assert_eq!(
            setting.get_path("model.width"),
            Some(&ParamValue::Int(64))
        );
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(GridSearchOptimizer::new(vec![spec("working_dir", &[1])], None, 1).is_err());
        assert!(GridSearchOptimizer::new(vec![spec("x", &[])], None, 1).is_err());
        assert!(GridSearchOptimizer::new(vec![spec("x", &[1])], None, 0).is_err());
    }
}
