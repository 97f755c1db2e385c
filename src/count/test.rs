use super::*;
use crate::config::{CounterConfig, CounterSelection, SampleBy, UserCounter, UserCounterKind};

fn user(spec: &str, kind: UserCounterKind) -> UserCounter {
    UserCounter {
        spec: spec.to_owned(),
        kind,
    }
}

fn names(counters: &Counters) -> Vec<&str> {
    counters.events.iter().map(|ev| ev.name.as_str()).collect()
}

#[test]
fn test_branch_selection_resolves_pair() {
    let cfg = CounterConfig {
        events: CounterSelection::Branch,
        ..Default::default()
    };
    let counters = Counters::init(&cfg).unwrap();
    assert_eq!(names(&counters), ["branches", "branch-misses"]);
    assert_eq!(counters.pct, Some((1, 0)));
}

#[test]
fn test_default_selection_counts_cycles() {
    let counters = Counters::init(&CounterConfig::default()).unwrap();
    assert_eq!(names(&counters), ["cycles"]);
    assert_eq!(counters.pct, None);
    assert!(counters.sample.is_none());
}

#[test]
fn test_native_board_selection() {
    let cfg = CounterConfig {
        events: CounterSelection::Native,
        ..Default::default()
    };
    let counters = Counters::init(&cfg).unwrap();
    assert_eq!(
        names(&counters),
        ["LLC-loads", "LLC-load-misses", "branch-misses"]
    );
}

#[test]
fn test_user_native_hex_parses_as_raw() {
    let cfg = CounterConfig {
        events: CounterSelection::User(vec![user("0x40001e1b", UserCounterKind::Native)]),
        ..Default::default()
    };
    let counters = Counters::init(&cfg).unwrap();
    assert_eq!(counters.events[0].ty, b::PERF_TYPE_RAW);
    assert_eq!(counters.events[0].config, 0x40001e1b);
}

#[test]
fn test_user_native_rejects_bad_hex() {
    let cfg = CounterConfig {
        events: CounterSelection::User(vec![user("zz", UserCounterKind::Native)]),
        ..Default::default()
    };
    assert!(matches!(
        Counters::init(&cfg),
        Err(Error::InvalidNativeCode(_))
    ));
}

#[test]
fn test_unknown_preset_rejected() {
    let cfg = CounterConfig {
        events: CounterSelection::User(vec![user("no-such-counter", UserCounterKind::Preset)]),
        ..Default::default()
    };
    assert!(matches!(Counters::init(&cfg), Err(Error::UnknownPreset(_))));
}

#[test]
fn test_too_many_counters_rejected() {
    let list = (0..MAX_COUNTERS + 1)
        .map(|i| user(&format!("0x{i:x}"), UserCounterKind::Native))
        .collect();
    let cfg = CounterConfig {
        events: CounterSelection::User(list),
        ..Default::default()
    };
    assert!(matches!(Counters::init(&cfg), Err(Error::TooManyCounters)));
}

#[test]
fn test_sampling_counter_joins_the_list() {
    let cfg = CounterConfig {
        events: CounterSelection::Branch,
        sample_by: SampleBy::L1Miss,
        sample_period: None,
    };
    let counters = Counters::init(&cfg).unwrap();
    assert_eq!(
        names(&counters),
        ["branches", "branch-misses", "L1-dcache-load-misses"]
    );
    let spec = counters.sample.as_ref().unwrap();
    assert_eq!(spec.period, SAMPLE_PERIOD_L1_MISS);
    assert_eq!(spec.event.name, "L1-dcache-load-misses");
}

#[test]
fn test_sampling_counter_not_duplicated() {
    let cfg = CounterConfig {
        events: CounterSelection::CacheL1,
        sample_by: SampleBy::L1Miss,
        sample_period: Some(777),
    };
    let counters = Counters::init(&cfg).unwrap();
    assert_eq!(names(&counters), ["L1-dcache-loads", "L1-dcache-load-misses"]);
    assert_eq!(counters.sample.as_ref().unwrap().period, 777);
}

#[test]
fn test_report_formatting() {
    let mut mutator = [0u64; MAX_COUNTERS];
    mutator[0] = 1_000;
    mutator[1] = 89;
    let zeros = [0u64; MAX_COUNTERS];

    let report = CounterReport {
        names: ["branches", "branch-misses"].into_iter().collect(),
        pct: Some((1, 0)),
        mutator_cycles: 1_234_567,
        gc0_cycles: 0,
        gc1_cycles: 0,
        mutator: &mutator,
        gc0: &zeros,
        gc1: &zeros,
    };
    let text = report.to_string();

    assert!(text.contains("Mutator CPU counters"));
    assert!(text.contains("GC(0) CPU counters"));
    assert!(text.contains("GC(1) CPU counters"));
    assert!(text.contains("1,234,567"));
    assert!(text.contains("branch-misses % of branches : 8.9%"));
}

#[test]
fn test_with_commas() {
    assert_eq!(with_commas(0), "0");
    assert_eq!(with_commas(999), "999");
    assert_eq!(with_commas(1_000), "1,000");
    assert_eq!(with_commas(1_234_567), "1,234,567");
}
