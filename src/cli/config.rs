use crate::config::generate::generate_starter_config;
use crate::config::{load_config, system_config_path, user_config_path};
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = generate_starter_config();

    if stdout {
        print!("{}", content);
        return Ok(());
    }

    let config_path = writable_config_path();
    write_config(&content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// `~/.config/logfan/config.yml` when its directory can be created, else the
/// system-wide location.
fn writable_config_path() -> PathBuf {
    if let Some(user_config) = user_config_path() {
        match user_config.parent().map(fs::create_dir_all) {
            Some(Ok(())) => return user_config,
            Some(Err(e)) => {
                eprintln!("Warning: Could not create directory for {}: {}", user_config.display(), e);
                eprintln!("Falling back to {}", system_config_path().display());
            }
            None => {}
        }
    }
    system_config_path()
}

/// Write a config file, refusing to overwrite an existing one.
pub fn write_config(content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match load_config(&path) {
        Ok(config) => {
            println!("✓ Config is valid ({} default groups)", config.groups.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            Err(e.into())
        }
    }
}
