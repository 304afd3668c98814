//! Parameter sweep over communication modes, core layouts and dispatch policies.
//!
//! Every combination is run `repeat` times end to end (build, schedule, stop) and the best
//! wall-clock time is kept. Results are keyed by combination index, in enumeration order.

use crate::config::{CommunicationMode, CoreAssignment, PipelineConfig, SharedCores};
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::scheduler::DispatchPolicy;
use crate::threading::{host_affinity, AffinityHandle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parameters of one sweep combination.
#[derive(Debug, Clone, Serialize)]
pub struct SweepParameters {
    pub mode: CommunicationMode,
    pub input_dir: PathBuf,
    pub fetcher_core: usize,
    pub statistics_core: usize,
    pub logger_core: usize,
    pub policy: DispatchPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepEntry {
    /// Best wall-clock time over all repeats, in seconds.
    pub time: f64,
    pub parameters: SweepParameters,
}

pub type SweepResults = BTreeMap<usize, SweepEntry>;

/// Stage core layouts explored by the sweep.
///
/// Starting from the set `{0}`, each stage in turn may take any core already in use or the next
/// unused one, which covers every way of grouping three stages onto cores up to relabeling.
pub fn core_assignments() -> Vec<[usize; 3]> {
    fn with(used: &[usize], core: usize) -> Vec<usize> {
        let mut next = used.to_vec();
        if !next.contains(&core) {
            next.push(core);
        }
        next
    }

    let mut layouts = Vec::new();
    let base = [0usize];
    for fetcher in 0..=base.len() {
        let used1 = with(&base, fetcher);
        for statistics in 0..=used1.len() {
            let used2 = with(&used1, statistics);
            for logger in 0..=used2.len() {
                layouts.push([fetcher, statistics, logger]);
            }
        }
    }
    layouts
}

/// Sweep settings. Fields of `base` not varied by the sweep (input, statistics, smoothing,
/// output file, ...) apply to every run.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub base: PipelineConfig,
    pub modes: Vec<CommunicationMode>,
    pub policies: Vec<DispatchPolicy>,
    pub repeat: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            base: PipelineConfig::default(),
            modes: CommunicationMode::ALL.to_vec(),
            policies: DispatchPolicy::ALL.to_vec(),
            repeat: 3,
        }
    }
}

/// Run the sweep with host pinning.
pub fn run_sweep(config: &SweepConfig) -> Result<SweepResults, PipelineError> {
    run_sweep_with_affinity(config, host_affinity())
}

pub fn run_sweep_with_affinity(
    config: &SweepConfig,
    affinity: AffinityHandle,
) -> Result<SweepResults, PipelineError> {
    let layouts = core_assignments();
    let mut results = SweepResults::new();
    let mut index = 0usize;

    for &mode in &config.modes {
        for layout in &layouts {
            for &policy in &config.policies {
                let mut run_config = config.base.clone();
                run_config.mode = mode;
                run_config.policy = policy;
                // Layouts co-locate stages on purpose.
                run_config.shared_cores = SharedCores::Allow;
                run_config.cores = CoreAssignment {
                    dispatcher: config.base.cores.dispatcher,
                    fetcher: layout[0],
                    statistics: layout[1],
                    logger: layout[2],
                };

                let mut best: Option<f64> = None;
                for _ in 0..config.repeat.max(1) {
                    let report = Pipeline::run_with_affinity(&run_config, affinity.clone())?;
                    best = Some(best.map_or(report.elapsed_secs, |b| b.min(report.elapsed_secs)));
                }
                let time = best.unwrap_or_default();
                tracing::info!(index, %mode, ?layout, %policy, time, "sweep combination done");

                results.insert(
                    index,
                    SweepEntry {
                        time,
                        parameters: SweepParameters {
                            mode,
                            input_dir: run_config.input_dir.clone(),
                            fetcher_core: layout[0],
                            statistics_core: layout[1],
                            logger_core: layout[2],
                            policy,
                        },
                    },
                );
                index += 1;
            }
        }
    }
    Ok(results)
}

pub fn write_results(path: &Path, results: &SweepResults) -> Result<(), PipelineError> {
    let json = serde_json::to_vec_pretty(results).map_err(crate::error::StageError::from)?;
    fs::write(path, json).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_cover_all_groupings() {
        let layouts = core_assignments();
        assert_eq!(layouts.len(), 15);
        assert_eq!(layouts.first(), Some(&[0, 0, 0]));
        assert_eq!(layouts.last(), Some(&[1, 2, 3]));
        assert!(layouts.contains(&[0, 1, 0]));
        assert!(!layouts.contains(&[0, 2, 1]));
    }

    #[test]
    fn layouts_never_skip_a_core() {
        for layout in core_assignments() {
            let mut used = vec![0usize];
            for core in layout {
                assert!(core <= used.len(), "{layout:?} skips a core");
                if !used.contains(&core) {
                    used.push(core);
                }
            }
        }
    }
}
