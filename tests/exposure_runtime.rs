mod common;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use credible::{
    config::Configuration,
    exposure::{ExposureError, ExposureRuntime, MountState, RecordKind, RecordState},
    paths::MountLayout,
    plan::{plan, PlanRequest, SystemHost},
    resolver::SecretTable,
    types::{SecretName, SecretValue},
};

use common::{configuration, RecordingMountDriver};

const STORAGE: &str = "[storage]\ntype = \"directory\"\nroot = \"/unused\"\n";

fn secrets_toml(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("[[secrets]]\nname = \"{name}\"\npath = \"{name}.age\"\n"))
        .collect()
}

fn file_exposure(secret: &str, path: &Path) -> String {
    format!(
        "[[exposures]]\ntype = \"file\"\nsecret = \"{secret}\"\npath = \"{}\"\n",
        path.display()
    )
}

fn table(entries: &[(&str, &[u8])]) -> SecretTable {
    SecretTable::from_entries(entries.iter().map(|(name, value)| {
        (
            SecretName::new(name).unwrap(),
            SecretValue::new(value.to_vec()),
        )
    }))
}

fn unused_layout(root: &Path) -> MountLayout {
    MountLayout::new(root.join("mnt"), root.join("secrets"))
}

fn config(root: &Path, secrets: &str, exposures: &str) -> Configuration {
    configuration(root, &[STORAGE, secrets, exposures])
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

#[test]
fn file_exposure_is_owner_read_only_and_removed_on_teardown() {
    let temp_dir = tempfile::tempdir().unwrap();
    let target = temp_dir.path().join("nested").join("deeper").join("db.txt");
    let config = config(
        temp_dir.path(),
        &secrets_toml(&["db"]),
        &file_exposure("db", &target),
    );
    let secrets = table(&[("db", b"hunter2")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());

    let materialized = runtime.materialize(&plan).unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"hunter2");
    assert_eq!(mode_of(&target), 0o400);
    let records = materialized.records().to_vec();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state(), RecordState::Materialized);
    assert!(matches!(
        records[0].kind(),
        RecordKind::File { created_dirs, .. } if created_dirs.len() == 2
    ));

    runtime.teardown(records).unwrap();
    assert!(!target.exists());
    assert!(!temp_dir.path().join("nested").exists());
}

#[test]
fn explicit_mode_is_applied() {
    let temp_dir = tempfile::tempdir().unwrap();
    let target = temp_dir.path().join("shared.txt");
    let exposures = format!("{}mode = 0o640\n", file_exposure("db", &target));
    let config = config(temp_dir.path(), &secrets_toml(&["db"]), &exposures);
    let secrets = table(&[("db", b"hunter2")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());

    let (records, _) = runtime.materialize(&plan).unwrap().into_parts();
    assert_eq!(mode_of(&target), 0o640);
    runtime.teardown(records).unwrap();
}

#[test]
fn env_exposures_are_handed_back_not_set() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exposures =
        "[[exposures]]\ntype = \"env\"\nsecret = \"api\"\nname = \"CREDIBLE_TEST_RUNTIME_TOKEN\"\n";
    let config = config(temp_dir.path(), &secrets_toml(&["api"]), exposures);
    let secrets = table(&[("api", b"token-value")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());

    let materialized = runtime.materialize(&plan).unwrap();
    let env = materialized.env();
    assert_eq!(env.len(), 1);
    assert_eq!(env[0].0, "CREDIBLE_TEST_RUNTIME_TOKEN");
    assert!(env[0].1.expose(|bytes| bytes == b"token-value"));
    assert!(std::env::var_os("CREDIBLE_TEST_RUNTIME_TOKEN").is_none());

    let (records, _) = materialized.into_parts();
    runtime.teardown(records).unwrap();
}

#[test]
fn third_of_four_failing_rolls_back_the_first_two() {
    let temp_dir = tempfile::tempdir().unwrap();
    let blocker = temp_dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    let targets: Vec<PathBuf> = vec![
        temp_dir.path().join("one").join("s1.txt"),
        temp_dir.path().join("s2.txt"),
        blocker.join("s3.txt"),
        temp_dir.path().join("s4.txt"),
    ];
    let names = ["s1", "s2", "s3", "s4"];
    let exposures: String = names
        .iter()
        .zip(&targets)
        .map(|(name, target)| file_exposure(name, target))
        .collect();
    let config = config(temp_dir.path(), &secrets_toml(&names), &exposures);
    let secrets = table(&[("s1", b"1"), ("s2", b"2"), ("s3", b"3"), ("s4", b"4")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());

    let error = runtime.materialize(&plan).unwrap_err();

    assert!(matches!(error, ExposureError::Materializing { ref secret, .. } if secret == "s3"));
    assert_eq!(
        error.destination(),
        Some(targets[2].display().to_string())
    );
    for target in &targets {
        assert!(!target.exists(), "{} survived rollback", target.display());
    }
    assert!(!temp_dir.path().join("one").exists());
    assert_eq!(fs::read(&blocker).unwrap(), b"not a directory");
}

#[test]
fn nul_byte_in_env_value_rolls_back_files() {
    let temp_dir = tempfile::tempdir().unwrap();
    let target = temp_dir.path().join("db.txt");
    let exposures = format!(
        "{}[[exposures]]\ntype = \"env\"\nsecret = \"db\"\nname = \"CREDIBLE_TEST_NUL_VALUE\"\n",
        file_exposure("db", &target)
    );
    let config = config(temp_dir.path(), &secrets_toml(&["db"]), &exposures);
    let secrets = table(&[("db", b"bad\0value")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());

    let error = runtime.materialize(&plan).unwrap_err();
    assert!(matches!(error, ExposureError::InvalidEnvValue { .. }));
    assert!(!error.to_string().contains("bad"));
    assert!(!target.exists());
}

#[test]
fn teardown_continues_past_failures_and_reports_them() {
    let temp_dir = tempfile::tempdir().unwrap();
    let targets: Vec<PathBuf> = ["a.txt", "b.txt", "c.txt"]
        .iter()
        .map(|name| temp_dir.path().join(name))
        .collect();
    let names = ["a", "b", "c"];
    let exposures: String = names
        .iter()
        .zip(&targets)
        .map(|(name, target)| file_exposure(name, target))
        .collect();
    let config = config(temp_dir.path(), &secrets_toml(&names), &exposures);
    let secrets = table(&[("a", b"a"), ("b", b"b"), ("c", b"c")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());
    let (records, _) = runtime.materialize(&plan).unwrap().into_parts();

    // swap the middle file for a directory teardown refuses to delete
    fs::set_permissions(&targets[1], fs::Permissions::from_mode(0o600)).unwrap();
    fs::remove_file(&targets[1]).unwrap();
    fs::create_dir(&targets[1]).unwrap();

    let error = runtime.teardown(records).unwrap_err();
    assert_eq!(error.failures().len(), 1);
    assert_eq!(error.failures()[0].destination, targets[1].display().to_string());
    assert!(!targets[0].exists());
    assert!(!targets[2].exists());
    assert!(targets[1].is_dir());
}

#[test]
fn missing_file_at_teardown_is_not_a_failure() {
    let temp_dir = tempfile::tempdir().unwrap();
    let target = temp_dir.path().join("db.txt");
    let config = config(
        temp_dir.path(),
        &secrets_toml(&["db"]),
        &file_exposure("db", &target),
    );
    let secrets = table(&[("db", b"hunter2")]);
    let request = PlanRequest::command(unused_layout(temp_dir.path()), MountState::Unmounted);
    let plan = plan(&config, &secrets, &request, &SystemHost).unwrap();
    let runtime = ExposureRuntime::new(RecordingMountDriver::default());
    let (records, _) = runtime.materialize(&plan).unwrap().into_parts();

    fs::set_permissions(&target, fs::Permissions::from_mode(0o600)).unwrap();
    fs::remove_file(&target).unwrap();

    runtime.teardown(records).unwrap();
}
