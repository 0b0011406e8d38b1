//! Result artifacts.
//!
//! One markdown file per successful generation, named
//! `{model}_{prompt}_{YYYYMMDD_HHMMSS}[_fallback].{ext}` and ending with an HTML comment
//! block describing the run. Any file with that shape counts as "already done".
//! The timestamp tag is required, so an artifact renamed by hand (say
//! `model_prompt_final.md`) is not detected and the pair runs again.

use crate::backend::Backend;
use crate::error::BenchError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

const FALLBACK_SUFFIX: &str = "_fallback";

/// What the metadata trailer records about one generation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResultMeta<'a> {
    pub backend: Backend,
    pub model_name: &'a str,
    pub prompt_name: &'a str,
    pub elapsed: Duration,
    pub fallback: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResultStore {
    dir: PathBuf,
    extension: String,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), BenchError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| BenchError::OutputWrite {
            path: self.dir.clone(),
            source,
        })
    }

    /// True when an artifact for this pair exists, whatever its timestamp.
    pub fn exists(&self, model_stem: &str, prompt_stem: &str) -> bool {
        let prefix = format!("{}_{}_", sanitize_stem(model_stem), sanitize_stem(prompt_stem));
        let suffix = format!(".{}", self.extension);
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .is_some_and(is_timestamp_tag)
        })
    }

    /// Write `text` plus the metadata trailer. Returns the new file's path.
    pub fn write(
        &self,
        model_stem: &str,
        prompt_stem: &str,
        text: &str,
        meta: &ResultMeta<'_>,
    ) -> Result<PathBuf, BenchError> {
        self.ensure_dir()?;
        let name = output_file_name(
            model_stem,
            prompt_stem,
            &timestamp_now(),
            meta.fallback,
            &self.extension,
        );
        let path = self.dir.join(name);
        let body = format!("{text}{}", metadata_trailer(meta));
        std::fs::write(&path, body).map_err(|source| BenchError::OutputWrite {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Replace path separators and `:` so a stem is usable in a file name.
pub(crate) fn sanitize_stem(stem: &str) -> String {
    stem.replace(['/', '\\', ':'], "_")
}

pub(crate) fn output_file_name(
    model_stem: &str,
    prompt_stem: &str,
    timestamp: &str,
    fallback: bool,
    extension: &str,
) -> String {
    let suffix = if fallback { FALLBACK_SUFFIX } else { "" };
    format!(
        "{}_{}_{timestamp}{suffix}.{extension}",
        sanitize_stem(model_stem),
        sanitize_stem(prompt_stem)
    )
}

/// `YYYYMMDD_HHMMSS`, optionally followed by `_fallback`.
fn is_timestamp_tag(tag: &str) -> bool {
    let stamp = tag.strip_suffix(FALLBACK_SUFFIX).unwrap_or(tag);
    let bytes = stamp.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}

pub(crate) fn metadata_trailer(meta: &ResultMeta<'_>) -> String {
    format!(
        "\n\n<!-- Benchmark Info -->\n\
         <!-- Backend: {} -->\n\
         <!-- Model: {} -->\n\
         <!-- Prompt: {} -->\n\
         <!-- Time: {:.2}s -->\n\
         <!-- Fallback: {} -->",
        meta.backend,
        meta.model_name,
        meta.prompt_name,
        meta.elapsed.as_secs_f64(),
        meta.fallback
    )
}

/// Local wall-clock time; UTC when the local offset cannot be determined.
fn timestamp_now() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))
    .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(fallback: bool) -> ResultMeta<'static> {
        ResultMeta {
            backend: Backend::Kobold,
            model_name: "Llama-3-8B.Q4.gguf",
            prompt_name: "snake.md",
            elapsed: Duration::from_millis(12_340),
            fallback,
        }
    }

    #[test]
    fn written_artifacts_are_detected() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::new(dir.path().join("results"), "md");
        assert!(!store.exists("Llama-3-8B.Q4", "snake"));

        let path = store.write("Llama-3-8B.Q4", "snake", "hello", &meta(true)).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Llama-3-8B.Q4_snake_"));
        assert!(name.ends_with("_fallback.md"));
        assert!(store.exists("Llama-3-8B.Q4", "snake"));
        assert!(!store.exists("Llama-3-8B.Q4", "tetris"));

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("hello\n\n<!-- Benchmark Info -->\n"));
        assert!(body.contains("<!-- Backend: koboldcpp -->"));
        assert!(body.contains("<!-- Model: Llama-3-8B.Q4.gguf -->"));
        assert!(body.contains("<!-- Time: 12.34s -->"));
        assert!(body.contains("<!-- Fallback: true -->"));
    }

    #[test]
    fn skip_check_requires_exact_stems_and_a_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::new(dir.path(), "md");
        std::fs::write(dir.path().join("m_p10_20250101_120000.md"), "x").unwrap();
        std::fs::write(dir.path().join("m_p2_notes.md"), "x").unwrap();
        std::fs::write(dir.path().join("m_p3_20250101_120000.txt"), "x").unwrap();

        assert!(store.exists("m", "p10"));
        assert!(!store.exists("m", "p1"));
        assert!(!store.exists("m", "p2"));
        assert!(!store.exists("m", "p3"));
    }

    #[test]
    fn stems_are_sanitized() {
        assert_eq!(
            output_file_name("org/model:q4", "a\\b", "20250102_030405", false, "md"),
            "org_model_q4_a_b_20250102_030405.md"
        );
        assert!(is_timestamp_tag("20250102_030405_fallback"));
        assert!(!is_timestamp_tag("20250102-030405"));
        assert!(!is_timestamp_tag("2025010_0304051"));
    }
}
