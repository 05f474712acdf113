mod common;

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::{config, numbers, registry, scratch, spilling_config};
use srm::builtin::{self, Counts};
use srm::collections::Component;
use srm::distributed::{Connection, Message, Registration};
use srm::{Arg, Config, Error, Scheduler, VecInput, Worker};
use tempfile::TempDir;

struct LocalWorker {
    address: String,
    handle: JoinHandle<srm::SrmResult<()>>,
    _dir: TempDir,
}

fn spawn_worker() -> LocalWorker {
    let dir = scratch();
    let worker = Worker::bind("127.0.0.1:0", registry(), dir.path()).unwrap();
    let address = worker.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || worker.serve_one());
    LocalWorker {
        address,
        handle,
        _dir: dir,
    }
}

fn master_config(dir: &TempDir, workers: &[LocalWorker]) -> Config {
    config(dir, 2).with_workers(workers.iter().map(|w| w.address.clone()))
}

// Counts 0..600, four times each, over the master and `workers`
fn count_distributed(config: Arc<Config>, workers: Vec<LocalWorker>) -> Counts {
    let counts = {
        let scheduler = Scheduler::connect(Arc::clone(&config), registry()).unwrap();
        assert_eq!(scheduler.rank(), 0);
        assert_eq!(scheduler.num_workers(), workers.len() + 1);

        let mut job = vec![
            Arg::shipped_input(builtin::NUMBERS, VecInput::new(numbers(600, 4), 40)).unwrap(),
            Arg::constructed_mergeable(builtin::COUNTS, builtin::counts(scheduler.config())),
        ];
        let stats = scheduler.run(builtin::ADD_ONE, &mut job).unwrap();
        // 60 splits dealt over the ranks
        assert_eq!(stats.splits, 60 / (workers.len() + 1));
        assert_eq!(stats.failures, 0);
        job.swap_remove(1).into_inner::<Counts>().unwrap()
    };

    for worker in workers {
        worker.handle.join().unwrap().unwrap();
    }
    counts
}

fn assert_complete(counts: &Counts) {
    assert_eq!(counts.len(), 600);
    for key in 0..600u64 {
        assert_eq!(counts.get(&key).unwrap(), Some(4), "count of {}", key);
    }
    let mut total = 0;
    for entry in counts.iter().unwrap() {
        let (key, value) = entry.unwrap();
        assert_eq!(value, 4, "count of {}", key);
        total += 1;
    }
    assert_eq!(total, 600);
}

#[test]
fn test_round_robin_over_workers() {
    let workers: Vec<LocalWorker> = (0..2).map(|_| spawn_worker()).collect();
    let dir = scratch();
    let config = Arc::new(master_config(&dir, &workers));

    let counts = count_distributed(config, workers);

    // Partitions are merged by rank i % 3, then all of them end up on the master
    assert_eq!(counts.partition_count(), 6);
    for i in 0..counts.partition_count() {
        assert_eq!(counts.owner_of(i), i % 3);
    }
    assert_complete(&counts);
}

#[test]
fn test_shared_dir_hands_over_files() {
    let workers: Vec<LocalWorker> = (0..2).map(|_| spawn_worker()).collect();
    let dir = scratch();
    let shared = scratch();
    let config = Arc::new(
        spilling_config(&dir, 2)
            .with_shared_dir(shared.path())
            .with_workers(workers.iter().map(|w| w.address.clone())),
    );

    let counts = count_distributed(config, workers);

    // Every partition arrives as a file in the shared directory
    let mut external = 0;
    for partition in counts.partitions().iter().filter(|p| !p.is_empty()) {
        match partition.current() {
            Component::External(map) => {
                assert!(map.path().starts_with(shared.path()));
                external += 1;
            }
            Component::Memory(_) => panic!("partition was not handed over as a file"),
        }
    }
    assert!(external > 0);
    assert_complete(&counts);
}

#[test]
fn test_worker_rejects_oversized_frame() {
    let worker = spawn_worker();
    let mut stream = TcpStream::connect(worker.address.as_str()).unwrap();
    stream.write_all(&u32::MAX.to_le_bytes()).unwrap();
    stream.flush().unwrap();

    let outcome = worker.handle.join().unwrap();
    assert!(matches!(outcome, Err(Error::Protocol(_))));
    drop(stream);
}

#[test]
fn test_unreachable_worker_is_skipped() {
    // Bind and drop a listener to get a port nobody listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let worker = spawn_worker();
    let dir = scratch();
    let config = Arc::new(
        config(&dir, 2).with_workers([format!("127.0.0.1:{}", port), worker.address.clone()]),
    );

    {
        let scheduler = Scheduler::connect(Arc::clone(&config), registry()).unwrap();
        assert_eq!(scheduler.num_workers(), 2);
        let mut job = vec![
            Arg::shipped_input(builtin::NUMBERS, VecInput::new(numbers(100, 2), 10)).unwrap(),
            Arg::constructed_mergeable(builtin::COUNTS, builtin::counts(scheduler.config())),
        ];
        let stats = scheduler.run(builtin::ADD_ONE, &mut job).unwrap();
        assert_eq!(stats.splits, 10);
    }
    worker.handle.join().unwrap().unwrap();
}

#[test]
fn test_local_arguments_are_not_shipped() {
    let worker = spawn_worker();
    let dir = scratch();
    let config = Arc::new(master_config(&dir, std::slice::from_ref(&worker)));

    {
        let scheduler = Scheduler::connect(Arc::clone(&config), registry()).unwrap();
        let mut job = vec![
            Arg::input(VecInput::new(numbers(10, 1), 5)),
            Arg::mergeable(builtin::counts(scheduler.config())),
        ];
        assert!(matches!(
            scheduler.run(builtin::ADD_ONE, &mut job),
            Err(Error::InvalidArgument(_))
        ));
    }
    worker.handle.join().unwrap().unwrap();
}

#[test]
fn test_worker_reports_unknown_operation() {
    let worker = spawn_worker();
    let dir = scratch();
    let config = config(&dir, 1);

    let stream = std::net::TcpStream::connect(worker.address.as_str()).unwrap();
    let mut conn = Connection::new(stream).unwrap();
    conn.send(&Message::Register(Registration {
        rank: 1,
        num_workers: 2,
        config,
    }))
    .unwrap();
    conn.send(&Message::Request(srm::distributed::WorkRequest {
        operation: "no_such_job".into(),
        args: Vec::new(),
    }))
    .unwrap();

    match conn.expect().unwrap() {
        Message::Finished(report) => {
            assert_eq!(report.rank, 1);
            assert!(report.error.unwrap().contains("no_such_job"));
        }
        other => panic!("unexpected {}", other.name()),
    }
    conn.shutdown().unwrap();
    worker.handle.join().unwrap().unwrap();
}
