mod common;

use std::io::Write;

use sct_sched::workloads::racy_counter;
use sct_sched::*;
use tempfile::NamedTempFile;

fn config_file(json: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(json.as_bytes()).unwrap();
    f
}

#[test]
fn test_json_config_drives_campaign() {
    common::setup_test();
    let f = config_file(
        r#"{
            "enable_pct_random_scheduler": true,
            "pct_n": 4,
            "pct_k": 20,
            "pct_d": 3,
            "seed": 1000,
            "use_seed": true,
            "runs": 8
        }"#,
    );
    let config = SchedConfig::load(f.path()).unwrap();
    assert_eq!(config.strategy_kind().unwrap(), StrategyKind::PctRandom);
    let (report, traces) = common::explore(&racy_counter(3), config);
    assert_eq!(report.runs.len(), 8);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(traces[3].seed(), Some(1003));
    assert!(traces.iter().all(|t| t.strategy() == "pct-random"));
}

#[test]
fn test_environment_overrides_file() {
    common::setup_test();
    let f = config_file(r#"{ "enable_pct_scheduler": true, "pct_bound": 1, "seed": 5, "use_seed": true }"#);
    let mut config = SchedConfig::load(f.path()).unwrap();
    config
        .apply_env_from(|key| match key {
            SEED_ENV => Some("entropy".into()),
            PCT_BOUND_ENV => Some("4".into()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.pct_bound, 4);
    assert_eq!(config.run_seed(0), None);
}

#[test]
fn test_unknown_or_conflicting_knobs_are_rejected() {
    common::setup_test();
    let f = config_file(r#"{ "enable_magic_scheduler": true }"#);
    assert!(matches!(
        SchedConfig::load(f.path()),
        Err(SchedError::Config(_))
    ));

    let f = config_file(r#"{ "enable_pct_scheduler": true, "enable_random_scheduler": true }"#);
    let config = SchedConfig::load(f.path()).unwrap();
    assert!(config.strategy_kind().is_err());
}
