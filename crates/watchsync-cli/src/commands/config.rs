use crate::output::{new_table, Output, OutputFormat};
use crate::ConfigCommands;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, Color};
use owo_colors::OwoColorize;
use serde_json::json;
use watchsync_config::{Config, CredentialStore, PathManager, Role};

pub async fn run_config(cmd: ConfigCommands, output: &Output) -> Result<()> {
    match cmd {
        ConfigCommands::Show { full } => show_config(full, output),
        ConfigCommands::Init { force } => init_config(force, output),
        ConfigCommands::Path => show_paths(output),
    }
}

/// Config from the standard location, or the defaults when there is none yet.
pub fn load_config(paths: &PathManager) -> Result<Config> {
    let config_file = paths.config_file();
    if !config_file.exists() {
        tracing::debug!("No config file at {}, using defaults", config_file.display());
        return Ok(Config::default());
    }
    Config::load_from_file(&config_file)
        .map_err(|e| eyre!("Failed to load config from {}: {}", config_file.display(), e))
}

pub fn load_credentials(paths: &PathManager) -> Result<CredentialStore> {
    let mut credentials = CredentialStore::new(paths.credentials_file());
    credentials
        .load()
        .map_err(|e| eyre!("Failed to load credentials: {}", e))?;
    Ok(credentials)
}

fn show_config(full: bool, output: &Output) -> Result<()> {
    let paths = PathManager::default();
    let config_file = paths.config_file();
    if !config_file.exists() {
        output.warn(format!("Configuration file not found at: {}", config_file.display()));
        output.info("Run 'watchsync config init' to create one.");
        return Ok(());
    }
    let config = load_config(&paths)?;
    let credentials = load_credentials(&paths)?;

    let token_display = |role: Role| -> String {
        match config.resolve_token(role, &credentials) {
            Ok(token) if full => token,
            Ok(token) => mask_string(&token),
            Err(_) => "<not set>".to_string(),
        }
    };

    if !output.is_human() {
        let servers: Vec<_> = [Role::Source, Role::Destination]
            .into_iter()
            .map(|role| {
                let server = config.server(role);
                json!({
                    "role": role.as_str(),
                    "url": server.url,
                    "token": token_display(role),
                    "timeout_secs": server.timeout_secs,
                    "page_size": server.page_size,
                })
            })
            .collect();
        output.json(&json!({
            "type": "config",
            "config_file": config_file.display().to_string(),
            "servers": servers,
            "sync": config.sync,
            "cache": config.cache,
            "logging": config.logging,
        }));
        return Ok(());
    }
    if output.is_quiet() {
        return Ok(());
    }

    println!("{} {}\n", "Configuration".bright_cyan().bold(), config_file.display());

    let mut servers = new_table();
    servers.set_header(vec![
        Cell::new("Server").add_attribute(Attribute::Bold),
        Cell::new("URL"),
        Cell::new("Token"),
        Cell::new("Timeout"),
    ]);
    for role in [Role::Source, Role::Destination] {
        let server = config.server(role);
        let url = if server.url.is_empty() {
            Cell::new("<not set>").fg(Color::Red)
        } else {
            Cell::new(&server.url)
        };
        servers.add_row(vec![
            Cell::new(role.as_str()).fg(Color::Cyan),
            url,
            Cell::new(token_display(role)),
            Cell::new(format!("{}s", server.timeout_secs)),
        ]);
    }
    println!("{}", servers);

    let list_or_all = |values: &[String]| {
        if values.is_empty() {
            "all".to_string()
        } else {
            values.join(", ")
        }
    };
    let mut sync = new_table();
    sync.set_header(vec![Cell::new("Sync").add_attribute(Attribute::Bold), Cell::new("")]);
    sync.add_row(vec!["Users".to_string(), list_or_all(&config.sync.users)]);
    sync.add_row(vec!["Sections".to_string(), list_or_all(&config.sync.sections)]);
    sync.add_row(vec!["Agent mode".to_string(), config.sync.agent_mode.as_str().to_string()]);
    sync.add_row(vec!["Workers".to_string(), config.sync.workers.to_string()]);
    sync.add_row(vec!["Snapshot".to_string(), config.sync.snapshot.display().to_string()]);
    sync.add_row(vec!["Include unwatched".to_string(), config.sync.include_unwatched.to_string()]);
    sync.add_row(vec![
        "Convert GUIDs".to_string(),
        if config.sync.convert_guids {
            format!("via {}", config.sync.metadata_url)
        } else {
            "off".to_string()
        },
    ]);
    sync.add_row(vec![
        "Cache".to_string(),
        if config.cache.enabled {
            format!("on, listings kept {}h", config.cache.listing_ttl_hours)
        } else {
            "off".to_string()
        },
    ]);
    println!("{}", sync);

    if let Err(e) = config.validate() {
        output.warn(format!("Invalid configuration: {}", e));
    }
    Ok(())
}

fn init_config(force: bool, output: &Output) -> Result<()> {
    let paths = PathManager::default();
    paths
        .ensure_directories()
        .map_err(|e| eyre!("Failed to create configuration directories: {}", e))?;

    let config_file = paths.config_file();
    if config_file.exists() && !force {
        output.warn(format!("{} already exists (use --force to overwrite)", config_file.display()));
        return Ok(());
    }
    std::fs::write(&config_file, Config::template())
        .map_err(|e| eyre!("Failed to write {}: {}", config_file.display(), e))?;
    output.success(format!("Wrote {}", config_file.display()));
    output.info("Fill in the [source] and [destination] blocks, then run 'watchsync users' to check access.");
    Ok(())
}

fn show_paths(output: &Output) -> Result<()> {
    let paths = PathManager::default();
    let entries = [
        ("config", paths.config_file()),
        ("credentials", paths.credentials_file()),
        ("data", paths.data_dir().to_path_buf()),
        ("cache", paths.cache_dir()),
        ("logs", paths.log_dir().to_path_buf()),
    ];

    match output.format() {
        OutputFormat::Human => {
            let mut table = new_table();
            for (name, path) in &entries {
                table.add_row(vec![name.to_string(), path.display().to_string()]);
            }
            output.table(&table);
        }
        _ => {
            let map: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(name, path)| (name.to_string(), json!(path.display().to_string())))
                .collect();
            output.json(&json!({ "type": "paths", "paths": map }));
        }
    }
    Ok(())
}

fn mask_string(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return "<not set>".to_string();
    }
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_string() {
        assert_eq!(mask_string(""), "<not set>");
        assert_eq!(mask_string("abc"), "***");
        assert_eq!(mask_string("abcdefgh"), "ab***gh");
    }

    #[test]
    fn test_load_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathManager::with_base(dir.path());
        let config = load_config(&paths).unwrap();
        assert_eq!(config.sync.workers, 4);
        assert!(load_credentials(&paths).unwrap().is_empty());
    }
}
