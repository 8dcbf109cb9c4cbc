//! Unit tests for environment loading and preparation.

use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const ENVIRONMENTS_YAML: &str = "\
default: ci-manual
environments:
  ci-manual:
    type: manual
    bootstrap-host: placeholder
    admin-secret: hunter2
  ci-maas:
    type: maas
    maas-server: http://maas.example/MAAS
    ssl-hostname-verification: false
    bootstrap-timeout: 1800
  ci-local:
    type: local
    default-series: trusty
    lxc-clone: null
";

struct JujuHome {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn juju_home() -> JujuHome {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|raw| panic!("non utf-8 tempdir: {}", raw.display()));
    std::fs::write(path.join(ENVIRONMENTS_FILE), ENVIRONMENTS_YAML)
        .unwrap_or_else(|err| panic!("write environments.yaml: {err}"));
    JujuHome { _dir: dir, path }
}

#[rstest]
#[case("manual", ProviderKind::Manual)]
#[case("maas", ProviderKind::Virtualized)]
#[case("ec2", ProviderKind::Generic)]
#[case("local", ProviderKind::Generic)]
#[case("", ProviderKind::Generic)]
fn provider_kind_follows_type(#[case] provider_type: &str, #[case] expected: ProviderKind) {
    assert_eq!(ProviderKind::from_type(provider_type), expected);
}

#[rstest]
fn load_stringifies_scalars_and_drops_nulls(juju_home: JujuHome) {
    let maas = Environment::load(&juju_home.path, "ci-maas")
        .unwrap_or_else(|err| panic!("load ci-maas: {err}"));
    let local = Environment::load(&juju_home.path, "ci-local")
        .unwrap_or_else(|err| panic!("load ci-local: {err}"));

    assert_eq!(maas.provider(), ProviderKind::Virtualized);
    assert_eq!(
        maas.config.get("ssl-hostname-verification").map(String::as_str),
        Some("false")
    );
    assert_eq!(maas.config.get("bootstrap-timeout").map(String::as_str), Some("1800"));
    assert!(local.is_local());
    assert!(!local.config.contains_key("lxc-clone"));
    assert_eq!(local.juju_home, juju_home.path);
}

#[rstest]
fn load_reports_unknown_environment(juju_home: JujuHome) {
    let err = Environment::load(&juju_home.path, "missing").expect_err("undefined environment");
    assert!(matches!(err, EnvironmentError::Unknown { ref name, .. } if name == "missing"));
}

#[rstest]
fn apply_renames_and_overrides_only_given_keys(juju_home: JujuHome) {
    let mut env = Environment::load(&juju_home.path, "ci-manual")
        .unwrap_or_else(|err| panic!("load: {err}"));

    env.apply(&EnvironmentOverrides {
        name: String::from("job-1"),
        series: Some(String::from("trusty")),
        bootstrap_host: Some(String::from("10.0.0.1")),
        agent_url: None,
    });

    assert_eq!(env.name, "job-1");
    assert_eq!(env.config.get("default-series").map(String::as_str), Some("trusty"));
    assert_eq!(env.config.get("bootstrap-host").map(String::as_str), Some("10.0.0.1"));
    assert!(!env.config.contains_key("tools-metadata-url"));
    assert_eq!(env.provider(), ProviderKind::Manual);
    assert_eq!(
        env.descriptor_path(),
        juju_home.path.join("environments").join("job-1.jenv")
    );
}

#[rstest]
fn remove_stale_descriptor_only_reports_existing_files(juju_home: JujuHome) {
    let env = Environment::from_config("job-1", BTreeMap::new(), juju_home.path.clone());
    std::fs::create_dir_all(juju_home.path.join("environments"))
        .unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(env.descriptor_path(), "stale")
        .unwrap_or_else(|err| panic!("write descriptor: {err}"));

    assert_eq!(env.remove_stale_descriptor(), Ok(true));
    assert_eq!(env.remove_stale_descriptor(), Ok(false));
    assert!(!env.descriptor_path().exists());
}

#[rstest]
fn local_root_prefers_root_dir(juju_home: JujuHome) {
    let mut env = Environment::from_config("job-1", BTreeMap::new(), juju_home.path.clone());
    assert_eq!(env.local_root(), juju_home.path.join("job-1"));

    env.config
        .insert(String::from("root-dir"), String::from("/srv/juju/local"));
    assert_eq!(env.local_root(), Utf8PathBuf::from("/srv/juju/local"));
}

#[rstest]
fn work_home_writes_single_test_mode_environment(juju_home: JujuHome) {
    let mut env = Environment::load(&juju_home.path, "ci-local")
        .unwrap_or_else(|err| panic!("load: {err}"));
    env.apply(&EnvironmentOverrides {
        name: String::from("job-1"),
        ..EnvironmentOverrides::default()
    });

    let home = WorkHome::create(&env).unwrap_or_else(|err| panic!("work home: {err}"));
    let written = std::fs::read_to_string(home.path().join(ENVIRONMENTS_FILE))
        .unwrap_or_else(|err| panic!("read written file: {err}"));
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(&written).unwrap_or_else(|err| panic!("parse: {err}"));

    let job = &parsed["environments"]["job-1"];
    assert_eq!(job["test-mode"].as_str(), Some("true"));
    assert_eq!(job["type"].as_str(), Some("local"));
    assert_eq!(
        job["root-dir"].as_str(),
        Some(juju_home.path.join("job-1").as_str())
    );
    assert!(parsed["environments"]["ci-local"].is_null());
}

#[rstest]
fn dropping_work_home_moves_descriptor_back(juju_home: JujuHome) {
    let env = Environment::from_config(
        "job-1",
        BTreeMap::from([(String::from("type"), String::from("manual"))]),
        juju_home.path.clone(),
    );
    let home = WorkHome::create(&env).unwrap_or_else(|err| panic!("work home: {err}"));
    let temp_path = home.path().to_path_buf();
    std::fs::create_dir_all(temp_path.join("environments"))
        .unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(temp_path.join("environments/job-1.jenv"), "state-servers: [10.0.0.1]")
        .unwrap_or_else(|err| panic!("write descriptor: {err}"));

    drop(home);

    assert!(!temp_path.exists());
    let retained = std::fs::read_to_string(env.descriptor_path())
        .unwrap_or_else(|err| panic!("descriptor should be retained: {err}"));
    assert_eq!(retained, "state-servers: [10.0.0.1]");
}

#[rstest]
fn work_home_is_created_inside_the_scratch_dir(juju_home: JujuHome) {
    let env = Environment::from_config(
        "job-1",
        BTreeMap::from([(String::from("type"), String::from("manual"))]),
        juju_home.path.clone(),
    );
    let scratch = juju_home.path.join("scratch");
    std::fs::create_dir_all(&scratch).unwrap_or_else(|err| panic!("mkdir: {err}"));

    let home =
        WorkHome::create_in(&env, &scratch).unwrap_or_else(|err| panic!("work home: {err}"));

    assert!(home.path().starts_with(&scratch));
    assert!(home.path().join(ENVIRONMENTS_FILE).exists());
}

#[rstest]
fn missing_scratch_dir_is_reported(juju_home: JujuHome) {
    let env = Environment::from_config(
        "job-1",
        BTreeMap::from([(String::from("type"), String::from("manual"))]),
        juju_home.path.clone(),
    );
    let scratch = juju_home.path.join("missing");

    let result = WorkHome::create_in(&env, &scratch);

    assert!(
        matches!(result, Err(EnvironmentError::Io { ref path, .. }) if *path == scratch),
        "unexpected result: {result:?}"
    );
}
