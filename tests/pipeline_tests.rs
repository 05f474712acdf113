mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{config, numbers, registry, scratch, spilling_config};
use rand::seq::SliceRandom;
use srm::builtin::{self, Counts, WordIndex};
use srm::{Arg, Config, Scheduler, VecInput};

fn count(config: Config, count: u64, repeat: u64, chunk: usize) -> Counts {
    let scheduler = Scheduler::new(Arc::new(config), registry()).unwrap();
    let mut job = vec![
        Arg::input(VecInput::new(numbers(count, repeat), chunk)),
        Arg::mergeable(builtin::counts(scheduler.config())),
    ];
    let stats = scheduler.run(builtin::ADD_ONE, &mut job).unwrap();
    assert_eq!(stats.failures, 0);
    job.swap_remove(1).into_inner::<Counts>().unwrap()
}

fn copy(config: Config, input: Counts, times: usize) -> Counts {
    let scheduler = Scheduler::new(Arc::new(config), registry()).unwrap();
    let mut job = vec![Arg::input(input), Arg::mergeable(builtin::counts(scheduler.config()))];
    for _ in 0..times {
        scheduler.run(builtin::COPY, &mut job).unwrap();
    }
    job.swap_remove(1).into_inner::<Counts>().unwrap()
}

fn assert_counts(counts: &Counts, keys: u64, expected: u64) {
    let mut seen = Vec::new();
    for entry in counts.iter().unwrap() {
        let (key, value) = entry.unwrap();
        assert_eq!(value, expected, "count of {}", key);
        seen.push(key);
    }
    seen.sort();
    assert_eq!(seen, (0..keys).collect::<Vec<_>>());
}

#[test]
fn test_addmany() {
    for threads in 1..=4 {
        let dir = scratch();
        let counts = count(config(&dir, threads), 1000, 4, 100);
        assert_eq!(counts.partition_count(), threads);
        assert_eq!(counts.len(), 1000);
        assert_counts(&counts, 1000, 4);
        assert_eq!(counts.get(&999).unwrap(), Some(4));
        assert_eq!(counts.get(&1000).unwrap(), None);
    }
}

#[test]
fn test_single_split_per_thread() {
    let dir = scratch();
    let scheduler = Scheduler::new(Arc::new(config(&dir, 4)), registry()).unwrap();
    let mut job = vec![
        Arg::input(VecInput::new(vec![1u64, 1, 1, 1], 1)),
        Arg::mergeable(builtin::counts(scheduler.config())),
    ];
    let stats = scheduler.run(builtin::ADD_ONE, &mut job).unwrap();
    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.splits, 4);
    let counts = job.swap_remove(1).into_inner::<Counts>().unwrap();
    assert_eq!(counts.get(&1).unwrap(), Some(4));
    assert_eq!(counts.len(), 1);
}

#[test]
fn test_two_stage_copy_doubles() {
    let dir = scratch();
    let counts = count(config(&dir, 3), 500, 4, 50);
    let doubled = copy(config(&dir, 3), counts, 2);
    assert_counts(&doubled, 500, 8);
}

#[test]
fn test_forced_externalization_gives_same_counts() {
    let resident_dir = scratch();
    let spill_dir = scratch();

    let resident = count(config(&resident_dir, 3), 2000, 3, 150);
    let spilled = count(spilling_config(&spill_dir, 3), 2000, 3, 150);

    assert!(resident.partitions().iter().all(|p| !p.is_spilled()));
    assert!(spilled.partitions().iter().all(|p| p.current().is_external()));
    assert!(spilled.partitions().iter().all(|p| p.on_disk().is_empty()));

    for key in [0u64, 17, 1999] {
        assert_eq!(spilled.get(&key).unwrap(), resident.get(&key).unwrap());
    }
    assert_counts(&spilled, 2000, 3);

    // Spilled partitions feed the next stage block by block
    let doubled = copy(spilling_config(&spill_dir, 2), spilled, 2);
    assert_counts(&doubled, 2000, 6);
}

#[test]
fn test_spilled_files_are_cleaned_up() {
    let dir = scratch();
    let counts = count(spilling_config(&dir, 2), 300, 2, 30);

    // One compacted file per partition is all that remains
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, counts.partition_count());
    let tmp = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tmp"))
        .count();
    assert_eq!(tmp, 0);
}

fn index_lines(config: Config, lines: Vec<(u64, String)>, min_len: usize) -> WordIndex {
    let scheduler = Scheduler::new(Arc::new(config), registry()).unwrap();
    let mut job = vec![
        Arg::input(VecInput::new(lines, 7)),
        Arg::mergeable(builtin::word_index(scheduler.config())),
        Arg::value(min_len),
    ];
    scheduler.run(builtin::INDEX_WORDS, &mut job).unwrap();
    job.swap_remove(1).into_inner::<WordIndex>().unwrap()
}

fn generated_lines() -> Vec<(u64, String)> {
    let words = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel"];
    let mut lines: Vec<(u64, String)> = (1..=200u64)
        .map(|n| {
            // Line n holds the words whose position divides n
            let text: Vec<&str> = words
                .iter()
                .enumerate()
                .filter(|(i, _)| n % (*i as u64 + 1) == 0)
                .map(|(_, w)| *w)
                .collect();
            (n, text.join(" "))
        })
        .collect();
    lines.shuffle(&mut rand::rng());
    lines
}

#[test]
fn test_multimap_union_across_threads() {
    for spill in [false, true] {
        let dir = scratch();
        let config = if spill {
            spilling_config(&dir, 4)
        } else {
            config(&dir, 4)
        };
        let index = index_lines(config, generated_lines(), 4);

        assert_eq!(index.get_all(&"alpha".into()).unwrap().len(), 200);
        let delta: BTreeSet<u64> = (1..=50).map(|n| n * 4).collect();
        assert_eq!(index.get_all(&"delta".into()).unwrap(), delta);
        assert!(index.contains(&"hotel".into(), &8).unwrap());
        assert!(!index.contains(&"hotel".into(), &12).unwrap());
        assert_eq!(index.get_all(&"golf".into()).unwrap().len(), 28);
    }
}

#[test]
fn test_sorted_iteration_order() {
    for spill in [false, true] {
        let dir = scratch();
        let config = if spill {
            spilling_config(&dir, 3)
        } else {
            config(&dir, 3)
        };
        let index = index_lines(config, generated_lines(), 4);
        let words: Vec<String> = index.keys().unwrap().map(|k| k.unwrap()).collect();
        assert_eq!(
            words,
            vec!["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel"]
        );
    }
}

#[test]
fn test_short_words_are_dropped() {
    let dir = scratch();
    let lines = vec![(1, "an ox and a yak".to_string()), (2, "the yak".to_string())];
    let index = index_lines(config(&dir, 2), lines, 3);
    let words: Vec<String> = index.keys().unwrap().map(|k| k.unwrap()).collect();
    assert_eq!(words, vec!["and", "the", "yak"]);
    assert_eq!(index.get_all(&"yak".into()).unwrap(), BTreeSet::from([1, 2]));
}
