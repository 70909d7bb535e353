//! MinerU conversion engine adapter, driving the `magic-pdf` CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use refkb_core::defaults::{
    IMAGES_DIR_NAME, IMAGE_EXTENSIONS, MINERU_BIN, MINERU_CONFIG_ENV, MINERU_METHOD,
};
use refkb_core::{ConversionEngine, EngineOutput, Error, ExtractedImage, Result};

use super::{binary_available, run_cmd};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MineruConfig {
    /// `magic-pdf` executable.
    pub bin: String,
    /// Parse method passed as `-m` (`auto`, `txt`, `ocr`).
    pub method: String,
    /// Engine configuration file, exported to the child process.
    pub tools_config: PathBuf,
}

impl MineruConfig {
    pub fn new(tools_config: impl Into<PathBuf>) -> Self {
        Self {
            bin: MINERU_BIN.to_string(),
            method: MINERU_METHOD.to_string(),
            tools_config: tools_config.into(),
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MINERU_TOOLS_CONFIG_JSON` | required | Engine configuration file |
    /// | `MINERU_BIN` | `magic-pdf` | Engine executable |
    /// | `MINERU_METHOD` | `auto` | Parse method |
    pub fn from_env() -> Result<Self> {
        let tools_config = std::env::var(MINERU_CONFIG_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config(format!("{} is not set", MINERU_CONFIG_ENV)))?;

        let mut config = Self::new(tools_config);
        if let Ok(bin) = std::env::var("MINERU_BIN") {
            if !bin.trim().is_empty() {
                config.bin = bin;
            }
        }
        if let Ok(method) = std::env::var("MINERU_METHOD") {
            if !method.trim().is_empty() {
                config.method = method;
            }
        }
        Ok(config)
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// The configuration file must exist before any conversion starts.
    pub fn validate(&self) -> Result<()> {
        if !self.tools_config.is_file() {
            return Err(Error::Config(format!(
                "engine configuration {} does not exist",
                self.tools_config.display()
            )));
        }
        Ok(())
    }
}

/// Converts PDFs to markdown by running `magic-pdf` in a scratch directory.
///
/// The engine writes `<work>/<stem>/<method>/<stem>.md` plus an `images/`
/// directory beside it; the adapter collects both.
pub struct MineruEngine {
    config: MineruConfig,
}

impl MineruEngine {
    /// Create an engine, validating its configuration.
    pub fn new(config: MineruConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Arguments for one invocation. The engine's end page is zero-based.
    fn args(&self, source: &Path, page_budget: Option<u32>, work_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            source.to_string_lossy().into_owned(),
            "-o".to_string(),
            work_dir.to_string_lossy().into_owned(),
            "-m".to_string(),
            self.config.method.clone(),
        ];
        if let Some(budget) = page_budget.filter(|b| *b > 0) {
            args.push("-e".to_string());
            args.push((budget - 1).to_string());
        }
        args
    }
}

#[async_trait]
impl ConversionEngine for MineruEngine {
    async fn convert(
        &self,
        source: &Path,
        page_budget: Option<u32>,
        work_dir: &Path,
    ) -> Result<EngineOutput> {
        if !source.is_file() {
            return Err(Error::Conversion(format!(
                "source file {} is missing or unreadable",
                source.display()
            )));
        }

        info!(
            subsystem = "convert",
            component = "mineru",
            source = %source.display(),
            page_budget = ?page_budget,
            "Running conversion engine"
        );

        run_cmd(
            Command::new(&self.config.bin)
                .args(self.args(source, page_budget, work_dir))
                .env(MINERU_CONFIG_ENV, &self.config.tools_config)
                .kill_on_drop(true),
        )
        .await?;

        collect_output(work_dir)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(binary_available(&self.config.bin, "--version").await)
    }

    fn name(&self) -> &str {
        "mineru"
    }
}

/// Collect the markdown and images an engine run left in `work_dir`.
pub fn collect_output(work_dir: &Path) -> Result<EngineOutput> {
    let md_path = find_markdown(work_dir)?.ok_or_else(|| {
        Error::Conversion("conversion engine produced no markdown".to_string())
    })?;
    let markdown = std::fs::read_to_string(&md_path)?;

    let mut images = Vec::new();
    let images_dir = md_path
        .parent()
        .map(|p| p.join(IMAGES_DIR_NAME))
        .unwrap_or_else(|| work_dir.join(IMAGES_DIR_NAME));
    if images_dir.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&images_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        entries.sort();
        for path in entries {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            images.push(ExtractedImage {
                file_name,
                data: std::fs::read(&path)?,
            });
        }
    }

    debug!(
        subsystem = "convert",
        component = "mineru",
        markdown = %md_path.display(),
        image_count = images.len(),
        "Collected engine output"
    );
    Ok(EngineOutput { markdown, images })
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// First markdown file under `dir`, searching breadth-first in name order.
fn find_markdown(dir: &Path) -> Result<Option<PathBuf>> {
    let mut queue = vec![dir.to_path_buf()];
    while !queue.is_empty() {
        let mut next = Vec::new();
        for current in queue {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&current)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            entries.sort();
            for path in entries {
                if path.is_dir() {
                    next.push(path);
                } else if path.extension().is_some_and(|e| e == "md") {
                    return Ok(Some(path));
                }
            }
        }
        queue = next;
    }
    Ok(None)
}
