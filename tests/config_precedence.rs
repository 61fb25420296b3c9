//! Configuration precedence: CLI > env > TOML > default.
//!
//! These tests mutate process environment variables, so they serialize on a
//! shared guard.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};

use mixseek::config::{CliOverrides, OrchestratorSettings, Provenance, Workspace};

fn env_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn clear_env() {
    for var in [
        "MIXSEEK_WORKSPACE",
        "MIXSEEK_MAX_ROUNDS",
        "MIXSEEK_MIN_ROUNDS",
        "MIXSEEK_ORCHESTRATOR__MAX_ROUNDS",
        "MIXSEEK_TIMEOUT_PER_TEAM_SECONDS",
    ] {
        std::env::remove_var(var);
    }
}

/// Scaffold a workspace whose orchestrator.toml pins max_rounds = 5.
fn scaffolded_workspace() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(dir.path());
    workspace.scaffold().unwrap();

    let orchestrator_path = workspace.configs_dir().join("orchestrator.toml");
    let contents = std::fs::read_to_string(&orchestrator_path).unwrap();
    let contents = contents.replace("max_rounds = 3", "max_rounds = 5");
    std::fs::write(&orchestrator_path, contents).unwrap();

    let root = dir.path().to_path_buf();
    (dir, root)
}

#[test]
fn toml_value_used_when_no_overrides() {
    let _guard = env_guard();
    clear_env();
    let (_dir, root) = scaffolded_workspace();

    let settings = OrchestratorSettings::load(&CliOverrides {
        workspace: Some(root),
        ..CliOverrides::default()
    })
    .unwrap();

    assert_eq!(settings.max_rounds, 5);
    assert_eq!(settings.provenance["max_rounds"], Provenance::Toml);
}

/// E6: env overrides TOML; CLI overrides both.
#[test]
fn env_overrides_toml_and_cli_overrides_env() {
    let _guard = env_guard();
    clear_env();
    let (_dir, root) = scaffolded_workspace();

    std::env::set_var("MIXSEEK_MAX_ROUNDS", "7");
    let settings = OrchestratorSettings::load(&CliOverrides {
        workspace: Some(root.clone()),
        ..CliOverrides::default()
    })
    .unwrap();
    assert_eq!(settings.max_rounds, 7);
    assert_eq!(settings.provenance["max_rounds"], Provenance::Env);

    let settings = OrchestratorSettings::load(&CliOverrides {
        workspace: Some(root),
        max_rounds: Some(3),
        ..CliOverrides::default()
    })
    .unwrap();
    assert_eq!(settings.max_rounds, 3);
    assert_eq!(settings.provenance["max_rounds"], Provenance::Cli);

    clear_env();
}

#[test]
fn nested_env_spelling_beats_flat() {
    let _guard = env_guard();
    clear_env();
    let (_dir, root) = scaffolded_workspace();

    std::env::set_var("MIXSEEK_MAX_ROUNDS", "9");
    std::env::set_var("MIXSEEK_ORCHESTRATOR__MAX_ROUNDS", "8");
    let settings = OrchestratorSettings::load(&CliOverrides {
        workspace: Some(root),
        ..CliOverrides::default()
    })
    .unwrap();
    assert_eq!(settings.max_rounds, 8);

    clear_env();
}

#[test]
fn workspace_env_is_honored_when_cli_absent() {
    let _guard = env_guard();
    clear_env();
    let (_dir, root) = scaffolded_workspace();

    std::env::set_var("MIXSEEK_WORKSPACE", root.to_str().unwrap());
    let settings = OrchestratorSettings::load(&CliOverrides::default()).unwrap();
    assert_eq!(settings.workspace_path, root);

    clear_env();
}

#[test]
fn missing_workspace_is_a_configuration_error() {
    let _guard = env_guard();
    clear_env();

    let err = OrchestratorSettings::load(&CliOverrides::default()).unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(err.to_string().contains("MIXSEEK_WORKSPACE"));
}

#[test]
fn invalid_override_combination_is_rejected() {
    let _guard = env_guard();
    clear_env();
    let (_dir, root) = scaffolded_workspace();

    // Env pushes min above max: validation must fail after layering.
    std::env::set_var("MIXSEEK_MIN_ROUNDS", "9");
    let err = OrchestratorSettings::load(&CliOverrides {
        workspace: Some(root),
        ..CliOverrides::default()
    })
    .unwrap_err();
    assert_eq!(err.kind(), "configuration");

    clear_env();
}
