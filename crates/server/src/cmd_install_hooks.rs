//! `orbitdock-server install-hooks` — configure Claude Code hooks.
//!
//! Safely merges OrbitDock hook entries into `~/.claude/settings.json`,
//! replacing stale OrbitDock entries in place and leaving everything else
//! untouched.

use std::path::{Path, PathBuf};

use crate::paths;

/// Claude Code hook event → OrbitDock wire message type.
const HOOK_TYPES: &[(&str, &str)] = &[
    ("SessionStart", "claude_session_start"),
    ("SessionEnd", "claude_session_end"),
    ("UserPromptSubmit", "claude_status_event"),
    ("Stop", "claude_status_event"),
    ("Notification", "claude_status_event"),
    ("PreCompact", "claude_status_event"),
    ("PreToolUse", "claude_tool_event"),
    ("PostToolUse", "claude_tool_event"),
    ("SubagentStart", "claude_subagent_event"),
    ("SubagentStop", "claude_subagent_event"),
];

pub fn run(settings_path: Option<&Path>) -> anyhow::Result<()> {
    let settings_file = settings_path.map(PathBuf::from).unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".claude/settings.json")
    });

    let hook_script = paths::hook_script_path();
    if !hook_script.exists() {
        anyhow::bail!(
            "Hook script not found at {}. Run `orbitdock-server init` first.",
            hook_script.display()
        );
    }

    let mut settings = if settings_file.exists() {
        serde_json::from_str::<serde_json::Value>(&std::fs::read_to_string(&settings_file)?)?
    } else {
        serde_json::json!({})
    };
    let root = settings
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json is not a JSON object"))?;

    let hooks = root
        .entry("hooks")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json 'hooks' is not an object"))?;

    let script = hook_script.to_string_lossy();
    let mut added = 0usize;
    let mut updated = 0usize;

    for &(event, msg_type) in HOOK_TYPES {
        let entry = serde_json::json!({
            "hooks": [{
                "type": "command",
                "command": format!("{script} {msg_type}"),
                "async": true
            }]
        });

        let list = hooks
            .entry(event)
            .or_insert_with(|| serde_json::json!([]));
        let Some(arr) = list.as_array_mut() else {
            continue;
        };

        let ours = arr.iter().position(|e| {
            e.get("hooks")
                .and_then(|h| h.as_array())
                .map(|h| {
                    h.iter().any(|cmd| {
                        cmd.get("command")
                            .and_then(|c| c.as_str())
                            .map(|c| c.contains("orbitdock") || c.contains("hook.sh"))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        });

        match ours {
            Some(idx) => {
                arr[idx] = entry;
                updated += 1;
            }
            None => {
                arr.push(entry);
                added += 1;
            }
        }
    }

    if settings_file.exists() {
        let backup = settings_file.with_extension("json.bak");
        std::fs::copy(&settings_file, &backup)?;
        println!("  Backed up settings to {}", backup.display());
    }
    if let Some(parent) = settings_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&settings_file, serde_json::to_string_pretty(&settings)?)?;

    println!();
    println!("  Hooks installed: {added} added, {updated} updated");
    println!("  Settings written to {}", settings_file.display());
    println!();

    Ok(())
}
