//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `scopestore_core` linkage without any application code.
//! - Optionally open a database and list the sets a context could bind to.
//!
//! Usage: `scopestore_cli [DB_PATH]`. `SCOPESTORE_LOG` sets the stderr log level.

use log::error;
use scopestore_core::logging::{self, LogSettings};
use scopestore_core::{core_version, ConnectionInfo, SqliteStore};
use std::process::ExitCode;

fn main() -> ExitCode {
    let level = std::env::var("SCOPESTORE_LOG")
        .unwrap_or_else(|_| logging::default_log_level().to_string());
    if let Err(err) = LogSettings::to_stderr(&level).and_then(logging::start) {
        eprintln!("logging disabled: {err}");
    }

    println!("scopestore_core version={}", core_version());

    let Some(path) = std::env::args().nth(1) else {
        return ExitCode::SUCCESS;
    };
    let info = ConnectionInfo::new(path);
    let sets = SqliteStore::open(&info).and_then(|store| store.list_sets());
    match sets {
        Ok(sets) => {
            println!("database={} sets={}", info.path(), sets.len());
            for set in sets {
                println!("  {set}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("event=cli_open module=cli status=error path={} error={}", info.path(), err);
            eprintln!("failed to open `{}`: {err}", info.path());
            ExitCode::FAILURE
        }
    }
}
