use std::sync::Mutex;

use busq::config::Config;
use busq::config::secrets::ExposeSecret;
use busq::model::ClaimStrategy;

// Tests in this file mutate process-wide environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("BUS_DEBUG");
        std::env::remove_var("BUS_CLAIM_STRATEGY");
    }
}

#[test]
fn config_from_env_loads_required_fields() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://bus.db");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url.expose_secret(), "sqlite://bus.db");
    assert!(!config.log_level.is_empty());
    assert!(!config.debug_events);
    assert_eq!(config.claim_strategy, ClaimStrategy::Returning);

    clear_env();
}

#[test]
fn config_reads_bus_options() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        std::env::set_var("BUS_DEBUG", "1");
        std::env::set_var("BUS_CLAIM_STRATEGY", "two_step");
    }

    let config = Config::from_env().unwrap();
    assert!(config.debug_events);
    assert_eq!(config.claim_strategy, ClaimStrategy::TwoStep);

    clear_env();
}

#[test]
fn config_rejects_unknown_claim_strategy() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        std::env::set_var("BUS_CLAIM_STRATEGY", "optimistic");
    }

    let err = Config::from_env().unwrap_err();
    assert_eq!(err.code(), "config_error");

    clear_env();
}

#[test]
fn config_from_env_fails_without_required() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let result = Config::from_env();
    assert!(result.is_err());
}
