use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, OnceLock},
};

use tempfile::TempDir;

use gemsieve::config;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("config env mutex poisoned")
}

const TRACKED: [&str; 6] = [
    "GEMSIEVE_CONFIG",
    "GEMSIEVE__AI__MODEL",
    "DATABASE_URL",
    "ollama_host",
    "ollama_api_key",
    "model_name",
];

fn clear_tracked() {
    for name in TRACKED {
        env::remove_var(name);
    }
}

fn write_config(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).expect("write config file");
    path
}

#[test]
fn defaults_apply_when_no_sources_exist() {
    let _guard = env_guard();
    clear_tracked();

    let cfg = config::load_from(None).expect("load defaults");
    assert_eq!(cfg.ai.provider, "ollama");
    assert_eq!(cfg.ai.model, "mistral-nemo");
    assert_eq!(cfg.gmail.default_query, "newer_than:1y");
    assert_eq!(cfg.engagement.max_outreach_per_day, 20);
}

#[test]
fn override_file_beats_defaults_and_env_beats_file() {
    let _guard = env_guard();
    clear_tracked();

    let dir = TempDir::new().expect("tempdir");
    let override_path = write_config(&dir, "override.yaml", "ai:\n  model: file-model\n");
    env::set_var("GEMSIEVE_CONFIG", &override_path);

    let cfg = config::load_from(None).expect("load with override file");
    assert_eq!(cfg.ai.model, "file-model");

    env::set_var("GEMSIEVE__AI__MODEL", "env-model");
    let cfg = config::load_from(None).expect("load with env override");
    assert_eq!(cfg.ai.model, "env-model");

    clear_tracked();
}

#[test]
fn explicit_path_argument_wins_over_the_env_pointer() {
    let _guard = env_guard();
    clear_tracked();

    let dir = TempDir::new().expect("tempdir");
    let env_file = write_config(&dir, "env.yaml", "ai:\n  model: env-file\n");
    let cli_file = write_config(&dir, "cli.yaml", "ai:\n  model: cli-file\n");
    env::set_var("GEMSIEVE_CONFIG", &env_file);

    let cfg = config::load_from(Some(cli_file)).expect("load with explicit path");
    assert_eq!(cfg.ai.model, "cli-file");

    clear_tracked();
}

#[test]
fn ad_hoc_env_overrides_apply_after_structured_sources() {
    let _guard = env_guard();
    clear_tracked();

    let dir = TempDir::new().expect("tempdir");
    let override_path = write_config(
        &dir,
        "override.yaml",
        "ai:\n  model: file-model\n  ollama_base_url: http://file-host:11434\nstorage:\n  sqlite_path: file.db\n",
    );
    env::set_var("GEMSIEVE_CONFIG", &override_path);
    env::set_var("model_name", "adhoc-model");
    env::set_var("ollama_host", "http://adhoc-host:11434");
    env::set_var("DATABASE_URL", "sqlite:///tmp/adhoc.db");

    let cfg = config::load_from(None).expect("load");
    assert_eq!(cfg.ai.model, "adhoc-model");
    assert_eq!(cfg.ai.ollama_base_url, "http://adhoc-host:11434");
    assert_eq!(cfg.storage.sqlite_path, PathBuf::from("/tmp/adhoc.db"));

    clear_tracked();
}

#[test]
fn load_dump_load_round_trips() {
    let _guard = env_guard();
    clear_tracked();

    let cfg = config::load_from(None).expect("load");
    let dumped = serde_yaml::to_string(&cfg).expect("dump");

    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "dumped.yaml", &dumped);
    let reloaded = config::load_from(Some(path)).expect("reload");
    assert_eq!(cfg, reloaded);

    clear_tracked();
}

#[test]
fn malformed_provider_is_a_fatal_config_error() {
    let _guard = env_guard();
    clear_tracked();

    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "bad.yaml", "ai:\n  provider: clippy\n");
    let result = config::load_from(Some(path));
    assert!(result.is_err());

    clear_tracked();
}
