use crate::models::AppConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "LEZHIQUAN_CONFIG_DIR";

#[derive(Debug, Clone)]
pub struct RuntimeFiles {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub session_file: PathBuf,
}

impl RuntimeFiles {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_file: config_dir.join("config.json"),
            session_file: config_dir.join("scm_session.json"),
            config_dir,
        }
    }

    pub fn log_path(&self, config: &AppConfig) -> PathBuf {
        let candidate = PathBuf::from(config.logging.file.trim());
        if candidate.is_absolute() {
            candidate
        } else {
            self.config_dir.join(candidate)
        }
    }
}

pub fn load_app_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(config_file)
        .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
    let config: AppConfig = serde_json::from_str(&raw).with_context(|| "解析 config.json 失败")?;
    Ok(config)
}

/// 命令行 `--config-dir` 优先，其次环境变量，最后当前目录
pub fn resolve_config_dir(args: &[String]) -> PathBuf {
    if let Some(arg_path) = parse_config_dir_from_args(args) {
        return arg_path;
    }
    if let Ok(raw) = std::env::var(CONFIG_DIR_ENV) {
        let text = raw.trim();
        if !text.is_empty() {
            return PathBuf::from(text);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn parse_config_dir_from_args(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config-dir" {
            return iter.next().map(PathBuf::from);
        }
    }
    None
}

/// 去掉 `--config-dir <dir>` 之后剩下的参数
pub fn strip_config_dir_args(args: &[String]) -> Vec<String> {
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config-dir" {
            iter.next();
            continue;
        }
        rest.push(arg.clone());
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_dir_argument_wins() {
        let argv = args(&["share", "C1", "--config-dir", "/tmp/lzq", "on"]);
        assert_eq!(resolve_config_dir(&argv), PathBuf::from("/tmp/lzq"));
        assert_eq!(strip_config_dir_args(&argv), args(&["share", "C1", "on"]));
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let files = RuntimeFiles::new(dir.path().to_path_buf());
        let config = load_app_config(&files.config_file).unwrap();
        assert_eq!(config.dispatch.send_interval_ms, 2500);
        assert_eq!(files.log_path(&config), dir.path().join("lezhiquan.log"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_app_config(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }
}
