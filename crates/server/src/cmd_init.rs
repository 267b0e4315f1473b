//! `orbitdock-server init` — bootstrap a fresh machine.
//!
//! Creates the data dir structure, runs migrations, installs the rendered
//! hook script, and prints next-steps guidance.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::migration_runner;
use crate::paths;

const HOOK_TEMPLATE: &str = include_str!("../../../scripts/hook.sh.template");

pub fn run(data_dir: &Path, server_url: &str) -> anyhow::Result<()> {
    println!();

    paths::ensure_dirs()?;
    println!("  Created {}/", data_dir.display());

    let db_path = paths::db_path();
    let mut conn = rusqlite::Connection::open(&db_path)?;
    migration_runner::run_migrations(&mut conn)?;
    println!("  Database initialized at {}", db_path.display());

    // Bake the server URL and optional auth token into the hook script.
    let auth_token = std::fs::read_to_string(paths::token_file_path())
        .ok()
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let rendered = HOOK_TEMPLATE
        .replace("{{SERVER_URL}}", server_url)
        .replace("{{AUTH_TOKEN}}", &auth_token);

    let hook_path = paths::hook_script_path();
    std::fs::write(&hook_path, &rendered)?;
    std::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))?;
    println!("  Hook script installed to {}", hook_path.display());

    println!();
    println!("  Next steps:");
    println!("    1. Install Claude Code hooks:  orbitdock-server install-hooks");
    println!("    2. Start the server:           orbitdock-server start");
    println!("    3. Install as a service:       orbitdock-server install-service --enable");
    println!();

    Ok(())
}
