use std::io::Write;

use anyhow::{anyhow, bail};
use rayon::prelude::*;
use structopt::StructOpt;

use collective::config::{read_config, ExperimentConfig};
use collective::runner::{run_case, verify};
use collective::ToStdDuration;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "Collective Experiment", about = "Collective Experiment")]
pub struct Opt {
    /// The configure file
    #[structopt(short = "c", long = "config")]
    pub config: Option<std::path::PathBuf>,

    /// The maximal concurrency to run the trials
    #[structopt(short = "P", long = "parallel", default_value = "1")]
    pub parallel: usize,
}

fn set_env_vars(config: &ExperimentConfig) {
    for (k, v) in config.envs.iter() {
        match v.as_str() {
            Some(v) => {
                log::debug!("setting environment {}={}", k, v);
                std::env::set_var(k, v);
            }
            None => log::warn!("ignoring non-string environment {}={}", k, v),
        }
    }
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::info!("Opts: {:#?}", opt);

    let path = opt
        .config
        .ok_or_else(|| anyhow!("config file is not specified"))?;
    log::info!("parsing experiment configuration from file: {:?}", path);
    let config = read_config(&path)?;
    log::info!("config: {:#?}", config);

    set_env_vars(&config);

    log::info!("using {} threads", opt.parallel);
    rayon::ThreadPoolBuilder::new()
        .num_threads(opt.parallel)
        .build_global()?;

    // create the output directory if it does not exist
    let result_file = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = dir.join("result.txt");
            std::fs::write(&file, format!("{:#?}\n", config))?;
            Some(file)
        }
        None => None,
    };

    let trials: Vec<(usize, usize)> = config
        .cases
        .iter()
        .enumerate()
        .flat_map(|(i, case)| (0..case.repeat).map(move |t| (i, t)))
        .collect();

    let lines = trials
        .into_par_iter()
        .map(|(case_id, trial_id)| run_trial(&config, case_id, trial_id))
        .collect::<anyhow::Result<Vec<String>>>()?;

    for line in &lines {
        println!("{}", line);
    }

    if let Some(file) = result_file {
        let mut f = std::fs::OpenOptions::new().append(true).open(&file)?;
        for line in &lines {
            writeln!(f, "{}", line)?;
        }
    }

    Ok(())
}

fn run_trial(config: &ExperimentConfig, case_id: usize, trial_id: usize) -> anyhow::Result<String> {
    let case = &config.cases[case_id];
    let mut setting = config.simulator.clone();
    setting.seed = setting.seed.wrapping_add(trial_id as u64);

    let outcome = run_case(case, &setting)?;
    if !verify(case, &outcome) {
        bail!(
            "case {} trial {}: {:?} produced a wrong result",
            case_id,
            trial_id,
            case.algorithm
        );
    }

    log::info!(
        "case {} trial {}: {:?} nprocs {} nelems {} finished in {:?}",
        case_id,
        trial_id,
        case.algorithm,
        case.nprocs,
        case.nelems,
        outcome.finish_time.to_dura()
    );
    Ok(format!(
        "case {} trial {} {:?} {} {} {}",
        case_id, trial_id, case.algorithm, case.nprocs, case.nelems, outcome.finish_time
    ))
}
