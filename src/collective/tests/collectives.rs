use collective::actor::{CollectiveActor, CollectiveRequest};
use collective::algorithm::{Algorithm, Context};
use collective::buffer::BufferManager;
use collective::config::CaseConfig;
use collective::dag::ActionGraph;
use collective::rank_map::VirtualRankMap;
use collective::reduce::{decode, encode, ReduceOp};
use collective::runner::{case_inputs, reference, run_case, verify};
use collective::simulator::{Endpoint, SimulatorBuilder, SimulatorSetting};
use collective::transport::TransportError;
use collective::{Communicator, Error};

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

fn check(c: &CaseConfig, setting: &SimulatorSetting) {
    let outcome = run_case(c, setting).unwrap_or_else(|e| panic!("{:?}: {}", c, e));
    assert_eq!(outcome.done.len(), c.nprocs, "{:?}", c);
    assert!(verify(c, &outcome), "{:?}: {:?}", c, outcome.results);
}

#[test]
fn allreduce_matches_sequential_reduction() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &nprocs in &[1, 2, 3, 5, 7, 8, 16, 17] {
        for &nelems in &[1, 7, 64] {
            for &in_place in &[false, true] {
                let mut c = case(Algorithm::RecursiveDoubling, nprocs, nelems);
                c.in_place = in_place;
                check(&c, &setting);
            }
        }
    }
}

#[test]
fn allreduce_operators() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &op in &[ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Max, ReduceOp::Min] {
        let mut c = case(Algorithm::RecursiveDoubling, 6, 5);
        c.reduce = op;
        check(&c, &setting);
    }
}

#[test]
fn bruck_and_direct_agree() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &nprocs in &[1, 2, 3, 4, 5, 8, 9] {
        for &nelems in &[1, 3] {
            for &in_place in &[false, true] {
                let mut bruck = case(Algorithm::Bruck, nprocs, nelems);
                bruck.in_place = in_place;
                let mut direct = case(Algorithm::Direct, nprocs, nelems);
                direct.in_place = in_place;

                let a = run_case(&bruck, &setting).unwrap();
                let b = run_case(&direct, &setting).unwrap();
                assert_eq!(a.results, b.results, "nprocs {} nelems {}", nprocs, nelems);
                assert!(verify(&bruck, &a));
            }
        }
    }
}

#[test]
fn direct_window_sizes() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &window in &[0, 1, 2, 7, 100] {
        let mut c = case(Algorithm::Direct, 7, 2);
        c.window = Some(window);
        check(&c, &setting);
    }
}

#[test]
fn scatter_from_every_root() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &nprocs in &[1, 2, 3, 4, 6, 8] {
        for root in 0..nprocs {
            for &in_place in &[false, true] {
                let mut c = case(Algorithm::BinaryTree, nprocs, 3);
                c.root = Some(root);
                c.in_place = in_place;
                check(&c, &setting);
            }
        }
    }
}

#[test]
fn results_survive_jitter_and_rendezvous() {
    logging::init_log();
    for seed in 0..4 {
        let setting = SimulatorSetting {
            jitter_ns: 5_000,
            seed,
            eager_threshold: 64,
            ..Default::default()
        };
        for &algorithm in &[
            Algorithm::RecursiveDoubling,
            Algorithm::Bruck,
            Algorithm::Direct,
            Algorithm::BinaryTree,
        ] {
            let mut c = case(algorithm, 6, 16);
            c.root = Some(seed as usize % 6);
            check(&c, &setting);
        }
    }
}

#[test]
fn graphs_are_acyclic_and_rounds_never_decrease() {
    logging::init_log();
    for &algorithm in &[
        Algorithm::RecursiveDoubling,
        Algorithm::Bruck,
        Algorithm::Direct,
        Algorithm::BinaryTree,
    ] {
        for &nprocs in &[1, 2, 3, 5, 8, 11] {
            for me in 0..nprocs {
                let ctx = Context {
                    me,
                    nproc: nprocs,
                    nelems: 4,
                    type_size: 8,
                    reduce: Some(ReduceOp::Sum.reduce_fn::<i64>()),
                };
                let root = nprocs / 2;
                let input_len = match algorithm {
                    Algorithm::RecursiveDoubling => 4,
                    Algorithm::BinaryTree if me != root => 0,
                    _ => 4 * nprocs,
                };
                let result_len = match algorithm {
                    Algorithm::Bruck | Algorithm::Direct => 4 * nprocs,
                    _ => 4,
                };
                let input = vec![0u8; input_len * 8];
                let mut result = vec![0u8; result_len * 8];
                let mut ep = Endpoint::new(me, nprocs);
                let mut bufs = BufferManager::new(Some(&input[..]), &mut result[..], 8);

                let mut collective = algorithm.build(root, None);
                collective.validate(&ctx).unwrap();
                collective.init_buffers(&ctx, &mut bufs, &mut ep).unwrap();
                let mut dag = ActionGraph::new(bufs.extents());
                collective.init_dag(&ctx, &mut dag).unwrap();

                assert_eq!(dag.topological_order().unwrap().len(), dag.len());
                for (p, c) in dag.edges() {
                    assert!(dag.action(p).round() <= dag.action(c).round());
                }
                bufs.release(&mut ep);
                assert_eq!(ep.live_workspaces(), 0);
            }
        }
    }
}

#[test]
fn virtual_ranks_are_a_bijection() {
    for nproc in 1..=40 {
        let map = VirtualRankMap::new(nproc).unwrap();
        let mut seen = vec![false; map.virtual_nproc()];
        for r in 0..nproc {
            let roles = map.real_to_virtual(r).unwrap();
            assert!(roles.len() == 1 || roles.len() == 2);
            for &v in roles.iter() {
                assert!(!seen[v], "virtual rank {} claimed twice", v);
                seen[v] = true;
                assert_eq!(map.virtual_to_real(v).unwrap(), r);
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}

#[test]
fn scratch_memory_is_balanced() {
    logging::init_log();
    let setting = SimulatorSetting::default();
    for &algorithm in &[
        Algorithm::RecursiveDoubling,
        Algorithm::Bruck,
        Algorithm::Direct,
        Algorithm::BinaryTree,
    ] {
        for &in_place in &[false, true] {
            let mut c = case(algorithm, 7, 9);
            c.in_place = in_place;
            let outcome = run_case(&c, &setting).unwrap();
            for (alloc, free) in &outcome.workspace_stats {
                assert_eq!(alloc, free, "{:?}", c);
            }
        }
    }
}

/// Build actors for `members` of a larger simulator and run them.
fn run_group(
    sim_nproc: usize,
    members: &[usize],
    setting: SimulatorSetting,
    nelems: usize,
) -> (collective::Result<usize>, Vec<(usize, usize)>, Vec<Vec<i64>>) {
    let n = members.len();
    let inputs: Vec<Vec<u8>> = (0..n)
        .map(|r| encode(&(0..n * nelems).map(|i| (r * 100 + i) as i64).collect::<Vec<_>>()))
        .collect();
    let mut results: Vec<Vec<u8>> = vec![vec![0u8; n * nelems * 8]; n];
    let mut sim = SimulatorBuilder::new()
        .with_setting(setting)
        .nproc(sim_nproc)
        .build()
        .unwrap();

    let actors = results
        .iter_mut()
        .zip(&inputs)
        .zip(members)
        .map(|((result, input), &global)| {
            let request = CollectiveRequest {
                comm: Communicator::split(members.to_vec(), global).unwrap(),
                tag: 3,
                nelems,
                type_size: 8,
                reduce: None,
                input: Some(&input[..]),
                result: &mut result[..],
            };
            CollectiveActor::new(request, Algorithm::Bruck.build(0, None)).unwrap()
        })
        .collect();

    let res = sim.run(actors).map(|done| done.len());
    let stats = members
        .iter()
        .map(|&g| {
            let ep = sim.endpoint(g).unwrap();
            (ep.live_workspaces(), ep.invalid_frees())
        })
        .collect();
    let decoded = results.iter().map(|r| decode::<i64>(r)).collect();
    (res, stats, decoded)
}

#[test]
fn subgroup_communicator() {
    logging::init_log();
    let members = [6, 1, 4, 3];
    let (res, stats, results) = run_group(8, &members, SimulatorSetting::default(), 2);
    assert_eq!(res.unwrap(), 4);
    assert!(stats.iter().all(|&s| s == (0, 0)));
    for (r, got) in results.iter().enumerate() {
        let expect: Vec<i64> = (0..4)
            .flat_map(|s| (0..2).map(move |j| (s * 100 + r * 2 + j) as i64))
            .collect();
        assert_eq!(got, &expect, "comm rank {}", r);
    }
}

#[test]
fn transport_failure_aborts_and_releases() {
    logging::init_log();
    let setting = SimulatorSetting {
        fail_after: Some(3),
        ..Default::default()
    };
    let (res, stats, _) = run_group(5, &[0, 1, 2, 3, 4], setting, 4);
    match res {
        Err(Error::TransportFailure(TransportError::Send { .. }))
        | Err(Error::TransportFailure(TransportError::Recv { .. })) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(stats.iter().all(|&s| s == (0, 0)), "{:?}", stats);
}

#[test]
fn workspace_limit_is_reported() {
    logging::init_log();
    let setting = SimulatorSetting {
        workspace_limit: Some(8),
        ..Default::default()
    };
    let (res, stats, _) = run_group(4, &[0, 1, 2, 3], setting, 16);
    assert!(
        matches!(
            res,
            Err(Error::TransportFailure(TransportError::OutOfWorkspace(_)))
        ),
        "{:?}",
        res
    );
    assert!(stats.iter().all(|&s| s == (0, 0)), "{:?}", stats);
}

#[test]
fn concurrent_collectives_with_distinct_tags() {
    logging::init_log();
    let nproc = 5;
    let nelems = 3;
    let reduce_case = case(Algorithm::RecursiveDoubling, nproc, nelems);
    let mut scatter_case = case(Algorithm::BinaryTree, nproc, nelems);
    scatter_case.root = Some(2);

    let reduce_inputs: Vec<Vec<u8>> = case_inputs(&reduce_case).iter().map(|v| encode(v)).collect();
    let scatter_inputs: Vec<Vec<u8>> = case_inputs(&scatter_case).iter().map(|v| encode(v)).collect();
    let mut reduce_results = vec![vec![0u8; nelems * 8]; nproc];
    let mut scatter_results = vec![vec![0u8; nelems * 8]; nproc];

    let mut actors = Vec::new();
    for (r, result) in reduce_results.iter_mut().enumerate() {
        let request = CollectiveRequest {
            comm: Communicator::world(r, nproc).unwrap(),
            tag: 1,
            nelems,
            type_size: 8,
            reduce: Some(ReduceOp::Sum.reduce_fn::<i64>()),
            input: Some(&reduce_inputs[r][..]),
            result: &mut result[..],
        };
        actors.push(CollectiveActor::new(request, Algorithm::RecursiveDoubling.build(0, None)).unwrap());
    }
    for (r, result) in scatter_results.iter_mut().enumerate() {
        let input = if scatter_inputs[r].is_empty() {
            None
        } else {
            Some(&scatter_inputs[r][..])
        };
        let request = CollectiveRequest {
            comm: Communicator::world(r, nproc).unwrap(),
            tag: 2,
            nelems,
            type_size: 8,
            reduce: None,
            input,
            result: &mut result[..],
        };
        actors.push(CollectiveActor::new(request, Algorithm::BinaryTree.build(2, None)).unwrap());
    }

    let mut sim = SimulatorBuilder::new().nproc(nproc).build().unwrap();
    let done = sim.run(actors).unwrap();
    assert_eq!(done.len(), 2 * nproc);

    let got: Vec<Vec<i64>> = reduce_results.iter().map(|r| decode(r)).collect();
    assert_eq!(got, reference(&reduce_case, &case_inputs(&reduce_case)));
    let got: Vec<Vec<i64>> = scatter_results.iter().map(|r| decode(r)).collect();
    assert_eq!(got, reference(&scatter_case, &case_inputs(&scatter_case)));
}

#[test]
fn duplicate_tags_on_one_rank_are_rejected() {
    let input = encode(&[1i64, 2]);
    let mut results = vec![vec![0u8; 16]; 2];
    let mut actors = Vec::new();
    for result in results.iter_mut() {
        let request = CollectiveRequest {
            comm: Communicator::world(0, 1).unwrap(),
            tag: 9,
            nelems: 2,
            type_size: 8,
            reduce: Some(ReduceOp::Sum.reduce_fn::<i64>()),
            input: Some(&input[..]),
            result: &mut result[..],
        };
        actors.push(CollectiveActor::new(request, Algorithm::RecursiveDoubling.build(0, None)).unwrap());
    }
    let mut sim = SimulatorBuilder::new().nproc(1).build().unwrap();
    assert!(matches!(sim.run(actors), Err(Error::InvalidTopology(_))));
}
