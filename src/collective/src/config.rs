use serde::{Deserialize, Serialize};

use crate::algorithm::Algorithm;
use crate::reduce::ReduceOp;
use crate::simulator::SimulatorSetting;
use crate::{Error, Rank, Result};

fn default_repeat() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseConfig {
    pub algorithm: Algorithm,

    /// Number of ranks in the communicator
    pub nprocs: usize,

    /// Elements per rank; i64 elements
    pub nelems: usize,

    /// Scatter root; default 0
    #[serde(default)]
    pub root: Option<Rank>,

    /// In-flight exchanges of direct all-to-all
    #[serde(default)]
    pub window: Option<usize>,

    /// Run on the result buffer only
    #[serde(default)]
    pub in_place: bool,

    /// All-reduce operator; default Sum
    #[serde(default)]
    pub reduce: ReduceOp,

    /// Number of trials, each with a different simulator seed
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

impl CaseConfig {
    pub fn root(&self) -> Rank {
        self.root.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(rename = "case")]
    pub cases: Vec<CaseConfig>,

    /// Simulator settings
    #[serde(default)]
    pub simulator: SimulatorSetting,

    /// Output path of the results
    #[serde(default)]
    pub directory: Option<std::path::PathBuf>,

    /// Environment variables
    #[serde(default)]
    pub envs: toml::value::Table,
}

impl ExperimentConfig {
    fn check(&self) -> Result<()> {
        for (i, case) in self.cases.iter().enumerate() {
            if case.nprocs == 0 {
                return Err(Error::Config(format!("case {}: nprocs must be positive", i)));
            }
            if case.root() >= case.nprocs {
                return Err(Error::Config(format!(
                    "case {}: root {} is not below nprocs {}",
                    i,
                    case.root(),
                    case.nprocs
                )));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ExperimentConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: ExperimentConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("parse failed: {}", e)))?;
        config.check()?;
        Ok(config)
    }
}

pub fn read_config<P: AsRef<std::path::Path>>(path: P) -> Result<ExperimentConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("fail to open {}: {}", path.display(), e)))?;
    content.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cases() {
        let config: ExperimentConfig = r#"
            [[case]]
            algorithm = "RecursiveDoubling"
            nprocs = 6
            nelems = 1024
            reduce = "Max"
            repeat = 3

            [[case]]
            algorithm = "BinaryTree"
            nprocs = 5
            nelems = 16
            root = 3
            in_place = true

            [simulator]
            latency_ns = 500
            jitter_ns = 100
            seed = 42
            fail_after = 4
        "#
        .parse()
        .unwrap();

        assert_eq!(config.cases.len(), 2);
        assert_eq!(config.cases[0].reduce, ReduceOp::Max);
        assert_eq!(config.cases[0].repeat, 3);
        assert_eq!(config.cases[1].root(), 3);
        assert_eq!(config.cases[1].repeat, 1);
        assert!(config.cases[1].in_place);
        assert_eq!(config.simulator.latency_ns, 500);
        assert_eq!(config.simulator.fail_after, Some(4));
        // untouched settings keep their defaults
        assert_eq!(
            config.simulator.eager_threshold,
            SimulatorSetting::default().eager_threshold
        );
    }

    #[test]
    fn reject_bad_cases() {
        let bad_root = r#"
            [[case]]
            algorithm = "BinaryTree"
            nprocs = 4
            nelems = 2
            root = 4
        "#;
        assert!(matches!(bad_root.parse::<ExperimentConfig>(), Err(Error::Config(_))));

        let unknown_field = r#"
            [[case]]
            algorithm = "Bruck"
            nprocs = 4
            nelems = 2
            stride = 3
        "#;
        assert!(unknown_field.parse::<ExperimentConfig>().is_err());
    }
}
