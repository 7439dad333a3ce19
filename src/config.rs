use anyhow::{Context, Result};
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: Option<PathBuf>,
    pub wrap: bool,
    pub max_width: u16,
    pub show_rules: bool,
    pub rules_width: u16,
    pub auto_apply: bool,
    pub highlight_color: String,
    pub preview_color: String,
    pub accent_color: String,
    pub reload_debounce_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: dirs::data_dir().map(|dir| dir.join("retext").join("replacements.json")),
            wrap: true,
            max_width: 100,
            show_rules: true,
            rules_width: 32,
            auto_apply: true,
            highlight_color: "cyan".to_string(),
            preview_color: "yellow".to_string(),
            accent_color: "green".to_string(),
            reload_debounce_ms: 150,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn highlight(&self) -> Color {
        color_or(&self.highlight_color, Color::Cyan)
    }

    pub fn preview(&self) -> Color {
        color_or(&self.preview_color, Color::Yellow)
    }

    pub fn accent(&self) -> Color {
        color_or(&self.accent_color, Color::Green)
    }
}

fn color_or(name: &str, fallback: Color) -> Color {
    Color::from_str(name.trim()).unwrap_or(fallback)
}

#[derive(Debug, Clone, Deserialize)]
struct PartialConfig {
    store_path: Option<PathBuf>,
    wrap: Option<bool>,
    max_width: Option<u16>,
    show_rules: Option<bool>,
    rules_width: Option<u16>,
    auto_apply: Option<bool>,
    highlight_color: Option<String>,
    preview_color: Option<String>,
    accent_color: Option<String>,
    reload_debounce_ms: Option<u64>,
    log_level: Option<String>,
}

impl PartialConfig {
    fn apply_defaults(self) -> (Config, bool) {
        let defaults = Config::default();
        let mut changed = false;

        let store_path = match self.store_path {
            Some(v) => Some(v),
            None => {
                changed = true;
                defaults.store_path
            }
        };
        let wrap = match self.wrap {
            Some(v) => v,
            None => {
                changed = true;
                defaults.wrap
            }
        };
        let max_width = match self.max_width {
            Some(v) => v,
            None => {
                changed = true;
                defaults.max_width
            }
        };
        let show_rules = match self.show_rules {
            Some(v) => v,
            None => {
                changed = true;
                defaults.show_rules
            }
        };
        let rules_width = match self.rules_width {
            Some(v) => v,
            None => {
                changed = true;
                defaults.rules_width
            }
        };
        let auto_apply = match self.auto_apply {
            Some(v) => v,
            None => {
                changed = true;
                defaults.auto_apply
            }
        };
        let highlight_color = match self.highlight_color {
            Some(v) => v,
            None => {
                changed = true;
                defaults.highlight_color
            }
        };
        let preview_color = match self.preview_color {
            Some(v) => v,
            None => {
                changed = true;
                defaults.preview_color
            }
        };
        let accent_color = match self.accent_color {
            Some(v) => v,
            None => {
                changed = true;
                defaults.accent_color
            }
        };
        let reload_debounce_ms = match self.reload_debounce_ms {
            Some(v) => v,
            None => {
                changed = true;
                defaults.reload_debounce_ms
            }
        };
        let log_level = match self.log_level {
            Some(v) => v,
            None => {
                changed = true;
                defaults.log_level
            }
        };

        (
            Config {
                store_path,
                wrap,
                max_width,
                show_rules,
                rules_width,
                auto_apply,
                highlight_color,
                preview_color,
                accent_color,
                reload_debounce_ms,
                log_level,
            },
            changed,
        )
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("retext").join("config.toml"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Reads the config at `path`, filling in and writing back missing keys.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        write_config_to(path, &cfg)?;
        return Ok(cfg);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let partial: PartialConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let (cfg, changed) = partial.apply_defaults();
    if changed {
        write_config_to(path, &cfg)?;
    }
    Ok(cfg)
}

pub fn write_config_to(path: &Path, cfg: &Config) -> Result<()> {
    ensure_parent_dir(path)?;
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_config_in_editor() -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        write_config_to(&path, &Config::default())?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let mut parts = match shell_words::split(&editor) {
        Ok(p) if !p.is_empty() => p,
        _ => vec![editor],
    };
    let cmd = parts.remove(0);
    let status = Command::new(cmd)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor for {}", path.display()))?;
    if !status.success() {
        anyhow::bail!("Editor exited with status {}", status);
    }
    Ok(())
}
