//! Run one configured case on the simulator and compare it with a sequential reference.
//! Cases always use `i64` elements.

use log::debug;

use crate::actor::{CollectiveActor, CollectiveDone, CollectiveRequest};
use crate::config::CaseConfig;
use crate::reduce::{decode, encode};
use crate::simulator::{SimulatorBuilder, SimulatorSetting};
use crate::{CollectiveKind, Communicator, Rank, Result, Timestamp};

const TYPE_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct CaseOutcome {
    /// what every rank ended up with, by communicator rank
    pub results: Vec<Vec<i64>>,
    pub done: Vec<CollectiveDone>,
    pub finish_time: Timestamp,
    /// `(allocations, frees)` of every endpoint
    pub workspace_stats: Vec<(usize, usize)>,
}

fn input_len(case: &CaseConfig, rank: Rank) -> usize {
    match case.algorithm.kind() {
        CollectiveKind::AllReduce => case.nelems,
        CollectiveKind::AllToAll => case.nprocs * case.nelems,
        CollectiveKind::Scatter if rank == case.root() => case.nprocs * case.nelems,
        CollectiveKind::Scatter => 0,
    }
}

fn output_len(case: &CaseConfig) -> usize {
    match case.algorithm.kind() {
        CollectiveKind::AllToAll => case.nprocs * case.nelems,
        CollectiveKind::AllReduce | CollectiveKind::Scatter => case.nelems,
    }
}

/// Distinct values per rank and position, small enough that products stay readable.
pub fn case_inputs(case: &CaseConfig) -> Vec<Vec<i64>> {
    (0..case.nprocs)
        .map(|r| {
            (0..input_len(case, r))
                .map(|i| (r as i64 + 1) * 1000 + (i as i64 % 97) - 48)
                .collect()
        })
        .collect()
}

pub fn reference(case: &CaseConfig, inputs: &[Vec<i64>]) -> Vec<Vec<i64>> {
    let n = case.nprocs;
    let m = case.nelems;
    match case.algorithm.kind() {
        CollectiveKind::AllReduce => {
            let mut acc = inputs[0].clone();
            for input in &inputs[1..] {
                for (a, &b) in acc.iter_mut().zip(input) {
                    *a = case.reduce.combine(*a, b);
                }
            }
            vec![acc; n]
        }
        CollectiveKind::AllToAll => (0..n)
            .map(|r| {
                (0..n)
                    .flat_map(|s| inputs[s][r * m..(r + 1) * m].iter().copied())
                    .collect()
            })
            .collect(),
        CollectiveKind::Scatter => (0..n)
            .map(|r| inputs[case.root()][r * m..(r + 1) * m].to_vec())
            .collect(),
    }
}

pub fn run_case(case: &CaseConfig, setting: &SimulatorSetting) -> Result<CaseOutcome> {
    let n = case.nprocs;
    let inputs: Vec<Vec<u8>> = case_inputs(case).iter().map(|v| encode(v)).collect();
    let mut results: Vec<Vec<u8>> = (0..n)
        .map(|r| {
            if case.in_place {
                let mut buf = inputs[r].clone();
                buf.resize(buf.len().max(output_len(case) * TYPE_SIZE), 0);
                buf
            } else {
                vec![0u8; output_len(case) * TYPE_SIZE]
            }
        })
        .collect();

    let mut sim = SimulatorBuilder::new()
        .with_setting(setting.clone())
        .nproc(n)
        .build()?;

    let reduce = Some(case.reduce.reduce_fn::<i64>());
    let actors = results
        .iter_mut()
        .enumerate()
        .map(|(r, result)| {
            let input = if case.in_place || inputs[r].is_empty() {
                None
            } else {
                Some(&inputs[r][..])
            };
            let request = CollectiveRequest {
                comm: Communicator::world(r, n)?,
                tag: 0,
                nelems: case.nelems,
                type_size: TYPE_SIZE,
                reduce,
                input,
                result: &mut result[..],
            };
            CollectiveActor::new(request, case.algorithm.build(case.root(), case.window))
        })
        .collect::<Result<Vec<_>>>()?;

    let done = sim.run(actors)?;
    let finish_time = done.iter().map(|d| d.finished_at).max().unwrap_or(0);
    debug!(
        "{:?} over {} ranks with {} elements finished at {} ns",
        case.algorithm, n, case.nelems, finish_time
    );

    let out = output_len(case) * TYPE_SIZE;
    Ok(CaseOutcome {
        results: results.iter().map(|r| decode::<i64>(&r[..out])).collect(),
        done,
        finish_time,
        workspace_stats: sim.endpoints().iter().map(|e| e.workspace_stats()).collect(),
    })
}

/// Whether the outcome matches the reference and every workspace went back.
pub fn verify(case: &CaseConfig, outcome: &CaseOutcome) -> bool {
    let expect = reference(case, &case_inputs(case));
    outcome.results == expect && outcome.workspace_stats.iter().all(|(a, f)| a == f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Algorithm;
    use crate::reduce::ReduceOp;

    fn case(algorithm: Algorithm, nprocs: usize, nelems: usize) -> CaseConfig {
        CaseConfig {
            algorithm,
            nprocs,
            nelems,
            root: None,
            window: None,
            in_place: false,
            reduce: ReduceOp::Sum,
            repeat: 1,
        }
    }

    #[test]
    fn reference_alltoall_transposes_blocks() {
        let c = case(Algorithm::Direct, 2, 1);
        let inputs = vec![vec![1, 2], vec![3, 4]];
        assert_eq!(reference(&c, &inputs), vec![vec![1, 3], vec![2, 4]]);
    }

    #[test]
    fn small_cases_verify() {
        let setting = SimulatorSetting::default();
        for algorithm in &[
            Algorithm::RecursiveDoubling,
            Algorithm::Bruck,
            Algorithm::Direct,
            Algorithm::BinaryTree,
        ] {
            let c = case(*algorithm, 5, 3);
            let outcome = run_case(&c, &setting).unwrap();
            assert!(verify(&c, &outcome), "{:?}", algorithm);
            assert_eq!(outcome.done.len(), 5);
            assert!(outcome.finish_time > 0);
        }
    }
}
