pub mod models {
    pub mod meter;
}

pub mod client;
pub mod config;
pub mod context;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
}
pub mod env_file;
pub mod identify {
    pub mod decoder;
    pub mod reconciler;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod cycle;
    pub mod fake_readings;
    pub mod manual;
}

use crate::client::MeterClient;
use crate::config::Config;
use crate::context::SessionContext;
use crate::db::store::PgStore;
use crate::models::meter::{DeviceId, DeviceStatus};
use crate::services::cycle::{CycleOutcome, CycleSettings, IdentificationCycle};
use crate::services::{cycle, fake_readings, manual};
use chrono::Utc;
use diesel::PgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info, warn};
use std::path::PathBuf;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Loop,
    Once,
    SetStatus(DeviceId, DeviceStatus),
    FakeReadings(usize),
}

#[derive(Debug, PartialEq)]
struct CliOptions {
    env_file: Option<PathBuf>,
    mode: Mode,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) if applied.is_empty() => {
            info!("Database schema is up to date; no migrations were applied");
            Ok(())
        }
        Ok(applied) => {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn log_alert_summary(client: &MeterClient) {
    match client.get_alerts() {
        Ok(resp) => match resp.alerts {
            Some(alerts) => info!("Alerts: {}", utils::summarize_alerts(&alerts).describe()),
            None => info!("Alerts: none"),
        },
        Err(e) => warn!("Alerts: fetch failed, continuing without summary: {}", e),
    }
}

fn run(mode: Mode) -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (user={}, role={:?}, identify_interval={}s, identify_enabled={}, http_timeout={}s, max_request_retries={}, reading_window={}, stale_after={}s, labels={}, maintenance_policy={:?})",
        cfg.user_id,
        cfg.user_role,
        cfg.identify_interval.as_secs(),
        cfg.identify_enabled,
        cfg.http_timeout.as_secs(),
        cfg.max_request_retries,
        cfg.reading_window,
        cfg.stale_after.as_secs(),
        cfg.labels
            .iter()
            .map(|l| format!("{}={}", l.token, l.device_name))
            .collect::<Vec<_>>()
            .join(","),
        cfg.maintenance_policy
    );

    let mut store = PgStore::establish(&cfg.database_url)?;
    info!("Connected to database");
    apply_database_migrations(store.connection())?;

    let ctx = SessionContext::new(cfg.user_id.clone(), cfg.user_role);

    let once = match mode {
        Mode::SetStatus(id, status) => {
            let device = manual::set_status_manual(&mut store, &ctx, &id, status, Utc::now())
                .map_err(|e| format!("set status failed: {}", e))?;
            info!("Device {} ({}) is now {}", device.name, device.id, device.status);
            return Ok(());
        }
        Mode::FakeReadings(count) => {
            fake_readings::run(&mut store, &ctx.user_id, count, &cfg.labels)?;
            return Ok(());
        }
        Mode::Once => true,
        Mode::Loop => false,
    };

    let client = MeterClient::new(cfg.meter_api_url.clone(), cfg.http_timeout, cfg.max_request_retries);
    log_alert_summary(&client);

    let settings = CycleSettings {
        reading_window: cfg.reading_window,
        stale_after: cfg.stale_after,
        maintenance_policy: cfg.maintenance_policy,
    };
    let mut identification = IdentificationCycle::new(ctx, cfg.labels.clone(), settings);

    if once {
        return match identification.run_once(&client, &mut store, Utc::now()) {
            Ok(CycleOutcome::Skipped(reason)) => {
                info!("Identify: cycle skipped ({:?})", reason);
                Ok(())
            }
            Ok(CycleOutcome::Applied(_)) => Ok(()),
            Err(e) => Err(format!("identification cycle failed: {}", e)),
        };
    }

    if cfg.identify_enabled {
        info!(
            "Starting identification loop: user={}, interval={}s",
            cfg.user_id,
            cfg.identify_interval.as_secs()
        );
        cycle::run_loop(&mut identification, &client, &mut store, cfg.identify_interval);
    } else {
        info!("Identification loop disabled via IDENTIFY_ENABLED={}", cfg.identify_enabled);
    }

    Ok(())
}

fn parse_set_status(value: &str) -> Result<Mode, String> {
    let (id, status) = value
        .split_once('=')
        .ok_or_else(|| "`--set-status` expects <device-id>=<status>".to_string())?;
    let id = id.trim();
    if id.is_empty() {
        return Err("`--set-status` requires a device id".to_string());
    }
    let status = status.trim().parse::<DeviceStatus>()?;
    Ok(Mode::SetStatus(DeviceId(id.to_string()), status))
}

fn parse_cli<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut mode: Option<Mode> = None;

    let mut set_mode = |next: Mode, flag: &str| -> Result<(), String> {
        if mode.replace(next).is_some() {
            return Err(format!("`{}` cannot be combined with another mode flag", flag));
        }
        Ok(())
    };

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            inline
                .clone()
                .or_else(|| args.next())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("`{}` requires a value", name))
        };

        match flag.as_str() {
            "--env-file" => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                env_file = Some(PathBuf::from(value("--env-file")?));
            }
            "--once" if inline.is_none() => set_mode(Mode::Once, "--once")?,
            "--set-status" => set_mode(parse_set_status(&value("--set-status")?)?, "--set-status")?,
            "--fake-readings" => {
                let count = value("--fake-readings")?
                    .parse::<usize>()
                    .map_err(|_| "`--fake-readings` expects a reading count".to_string())?;
                set_mode(Mode::FakeReadings(count), "--fake-readings")?;
            }
            "--" => break,
            _ => return Err(format!("unrecognised argument: {}", arg)),
        }
    }

    Ok(CliOptions {
        env_file,
        mode: mode.unwrap_or(Mode::Loop),
    })
}

fn load_env(explicit: Option<PathBuf>) -> Result<Option<(PathBuf, usize, bool)>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        let applied = env_file::load(&path)?;
        return Ok(Some((path, applied, true)));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    let applied = env_file::load(&default_path)?;
    Ok(Some((default_path, applied, false)))
}

fn main() {
    let prepared = parse_cli(std::env::args().skip(1)).and_then(|opts| Ok((load_env(opts.env_file)?, opts.mode)));
    let (loaded_env, mode) = match prepared {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // after the env file, so RUST_LOG from it applies
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, applied, explicit)) = loaded_env {
        let origin = if explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            path.display(),
            applied
        );
    }

    info!(
        "smartmeter-identify {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(mode) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
