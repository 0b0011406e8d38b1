//! Model and prompt discovery.
//!
//! Both directories are scanned non-recursively. Hidden files and files with another
//! extension are ignored silently; models dropped for size or because they are a later
//! part of a split file are reported back so the CLI can say why.

use crate::config::BenchConfig;
use crate::error::BenchError;
use crate::model::{ModelArtifact, PromptArtifact};
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterReason {
    /// `-00002-of-00003.gguf` and later parts; the first part loads the rest.
    SplitPart { part: u32, total: u32 },
    TooSmall { size_bytes: u64 },
    TooLarge { size_bytes: u64 },
    Unreadable { error: String },
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::SplitPart { part, total } => write!(f, "part {part} of {total}"),
            FilterReason::TooSmall { size_bytes } => {
                write!(f, "{:.2} GiB is below the minimum size", *size_bytes as f64 / GIB)
            }
            FilterReason::TooLarge { size_bytes } => {
                write!(f, "{:.2} GiB exceeds the maximum size", *size_bytes as f64 / GIB)
            }
            FilterReason::Unreadable { error } => write!(f, "cannot read file size: {error}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModelScan {
    /// Sorted by file name.
    pub models: Vec<ModelArtifact>,
    pub filtered: Vec<(String, FilterReason)>,
}

/// Matches `-00002-of-00003.{ext}`, case-insensitively.
fn split_part_pattern(ext: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)-(\d+)-of-(\d+)\.{}$", regex::escape(ext))).ok()
}

fn split_part(re: &Regex, file_name: &str) -> Option<(u32, u32)> {
    let caps = re.captures(file_name)?;
    let part = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((part, total))
}

/// Regular, non-hidden files in `dir` with extension `ext`, sorted by file name.
fn list_files(dir: &Path, ext: &str) -> Result<Vec<(PathBuf, String)>> {
    if !dir.is_dir() {
        bail!("directory not found: {}", dir.display());
    }
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        if !matches_ext || !path.is_file() {
            continue;
        }
        files.push((path, name));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Scan the models directory and attach the resolved per-model settings.
pub fn discover_models(cfg: &BenchConfig) -> Result<ModelScan> {
    let split = split_part_pattern(&cfg.model_extension);
    let mut scan = ModelScan::default();
    for (path, name) in list_files(&cfg.models_dir, &cfg.model_extension)? {
        match classify_model(cfg, split.as_ref(), path, &name) {
            Ok(model) => scan.models.push(model),
            Err(reason) => scan.filtered.push((name, reason)),
        }
    }
    Ok(scan)
}

fn classify_model(
    cfg: &BenchConfig,
    split: Option<&Regex>,
    path: PathBuf,
    name: &str,
) -> Result<ModelArtifact, FilterReason> {
    if let Some((part, total)) = split.and_then(|re| split_part(re, name)) {
        if part > 1 {
            return Err(FilterReason::SplitPart { part, total });
        }
    }

    let size_bytes = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!(model = %name, error = %e, "cannot stat model file, skipping it");
            return Err(FilterReason::Unreadable {
                error: e.to_string(),
            });
        }
    };
    if cfg.min_size_bytes.is_some_and(|min| size_bytes < min) {
        return Err(FilterReason::TooSmall { size_bytes });
    }
    if cfg.max_size_bytes.is_some_and(|max| size_bytes > max) {
        return Err(FilterReason::TooLarge { size_bytes });
    }

    Ok(ModelArtifact {
        stem: stem_of(&path),
        settings: cfg.model_settings(name),
        path,
        name: name.to_string(),
        size_bytes,
    })
}

pub fn discover_prompts(dir: &Path, ext: &str) -> Result<Vec<PromptArtifact>> {
    Ok(list_files(dir, ext)?
        .into_iter()
        .map(|(path, name)| PromptArtifact {
            stem: stem_of(&path),
            path,
            name,
        })
        .collect())
}

/// Read a prompt as text: invalid UTF-8 is replaced, a leading BOM is dropped and control
/// characters other than newline, carriage return and tab are removed.
pub fn read_prompt(path: &Path) -> Result<String, BenchError> {
    let raw = std::fs::read(path).map_err(|source| BenchError::PromptRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(sanitize_prompt(&String::from_utf8_lossy(&raw)))
}

fn sanitize_prompt(text: &str) -> String {
    text.trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| matches!(c, '\n' | '\r' | '\t') || !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, ConfigFile, ConfigOverrides};
    use std::fs;
    use tempfile::TempDir;

    fn config_for(models: &Path, max_gib: Option<f64>) -> BenchConfig {
        let file: ConfigFile = serde_json::from_value(serde_json::json!({
            "paths": {"models": models, "prompts": models, "results": models},
            "server": {"max_size_gib": max_gib},
            "backends": {"llamacpp": {"bin_path": "llama-server"}},
            "models": [{"pattern": "coder", "startup_args": ["--jinja"]}]
        }))
        .unwrap();
        BenchConfig::resolve(file, &ConfigOverrides::default()).unwrap()
    }

    fn sparse(dir: &Path, name: &str, len: u64) {
        let f = fs::File::create(dir.join(name)).unwrap();
        f.set_len(len).unwrap();
    }

    #[test]
    fn size_bound_drops_large_model() {
        let dir = TempDir::new().unwrap();
        sparse(dir.path(), "a.gguf", 2 << 30);
        sparse(dir.path(), "b.gguf", 50 << 30);

        let scan = discover_models(&config_for(dir.path(), Some(31.0))).unwrap();
        let names: Vec<_> = scan.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a.gguf"]);
        assert_eq!(scan.models[0].stem, "a");
        assert_eq!(scan.models[0].size_bytes, 2 << 30);
        assert!(matches!(
            scan.filtered.as_slice(),
            [(name, FilterReason::TooLarge { .. })] if name == "b.gguf"
        ));
    }

    #[test]
    fn later_split_parts_hidden_and_foreign_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        for name in [
            "big-00001-of-00002.gguf",
            "big-00002-of-00002.gguf",
            ".partial.gguf",
            "notes.txt",
            "Coder-7B.GGUF",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.gguf")).unwrap();

        let scan = discover_models(&config_for(dir.path(), None)).unwrap();
        let names: Vec<_> = scan.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Coder-7B.GGUF", "big-00001-of-00002.gguf"]);
        assert_eq!(scan.models[0].settings.startup_args, ["--jinja"]);
        assert!(scan.models[1].settings.startup_args.is_empty());
        assert_eq!(
            scan.filtered,
            vec![(
                "big-00002-of-00002.gguf".to_string(),
                FilterReason::SplitPart { part: 2, total: 2 }
            )]
        );
    }

    #[test]
    fn split_parts_follow_the_configured_extension() {
        let dir = TempDir::new().unwrap();
        for name in ["big-00001-of-00002.bin", "big-00002-of-00002.bin", "x.gguf"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut cfg = config_for(dir.path(), None);
        cfg.model_extension = "bin".into();

        let scan = discover_models(&cfg).unwrap();
        let names: Vec<_> = scan.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["big-00001-of-00002.bin"]);
        assert_eq!(
            scan.filtered,
            vec![(
                "big-00002-of-00002.bin".to_string(),
                FilterReason::SplitPart { part: 2, total: 2 }
            )]
        );
    }

    #[test]
    fn unreadable_model_is_filtered_not_fatal() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(dir.path(), None);
        let gone = dir.path().join("vanished.gguf");

        let reason = classify_model(&cfg, None, gone, "vanished.gguf").unwrap_err();
        assert!(matches!(reason, FilterReason::Unreadable { .. }));
        assert!(reason.to_string().starts_with("cannot read file size"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(discover_prompts(&dir.path().join("nope"), "md").is_err());
    }

    #[test]
    fn prompts_are_sorted_and_filtered_by_extension() {
        let dir = TempDir::new().unwrap();
        for name in ["b.md", "a.md", ".draft.md", "c.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        let prompts = discover_prompts(dir.path(), "md").unwrap();
        let stems: Vec<_> = prompts.iter().map(|p| p.stem.as_str()).collect();
        assert_eq!(stems, ["a", "b"]);
    }

    #[test]
    fn prompt_text_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.md");
        fs::write(&path, b"\xEF\xBB\xBFline one\r\n\tline\x07 two\x00\xFF\n").unwrap();
        assert_eq!(read_prompt(&path).unwrap(), "line one\r\n\tline two\u{fffd}\n");

        assert!(matches!(
            read_prompt(&dir.path().join("missing.md")),
            Err(BenchError::PromptRead { .. })
        ));
    }
}
