//! Page counting with `pdfinfo` (poppler-utils).

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use refkb_core::defaults::PAGE_COUNT_TIMEOUT_SECS;
use refkb_core::{Error, PageCounter, Result};

use super::run_cmd_with_timeout;

/// Reads page counts from `pdfinfo` without parsing page content.
pub struct PdfInfoPageCounter {
    bin: String,
    timeout_secs: u64,
}

impl Default for PdfInfoPageCounter {
    fn default() -> Self {
        Self {
            bin: "pdfinfo".to_string(),
            timeout_secs: PAGE_COUNT_TIMEOUT_SECS,
        }
    }
}

impl PdfInfoPageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `pdfinfo` executable.
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Page count from `pdfinfo` output (`Pages:  12`).
pub fn parse_pdfinfo_pages(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("pages") {
            value.trim().parse::<u32>().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl PageCounter for PdfInfoPageCounter {
    async fn page_count(&self, source: &Path) -> Result<u32> {
        if !source.is_file() {
            return Err(Error::Conversion(format!(
                "source file {} is missing or unreadable",
                source.display()
            )));
        }

        let output =
            run_cmd_with_timeout(Command::new(&self.bin).arg(source), self.timeout_secs).await?;

        match parse_pdfinfo_pages(&output) {
            Some(pages) if pages > 0 => {
                debug!(
                    subsystem = "convert",
                    component = "pdfinfo",
                    source = %source.display(),
                    pages,
                    "Read page count"
                );
                Ok(pages)
            }
            _ => Err(Error::Conversion(format!(
                "could not determine page count for {}",
                source.display()
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        // pdfinfo -v exits 0 or 99 depending on the poppler version.
        match Command::new(&self.bin).arg("-v").output().await {
            Ok(output) => Ok(output.status.success() || output.status.code() == Some(99)),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Title:          Biogeochemical hotspots\n\
                          Producer:       pdfTeX-1.40.18\n\
                          Pages:          150\n\
                          Page size:      595 x 842 pts (A4)\n";

    #[test]
    fn test_parse_pdfinfo_pages() {
        assert_eq!(parse_pdfinfo_pages(SAMPLE), Some(150));
    }

    #[test]
    fn test_parse_pdfinfo_pages_missing() {
        assert_eq!(parse_pdfinfo_pages("Title: x\nEncrypted: no\n"), None);
        assert_eq!(parse_pdfinfo_pages("Pages: many\n"), None);
    }

    #[tokio::test]
    async fn test_missing_source_is_conversion_error() {
        let counter = PdfInfoPageCounter::new();
        let err = counter
            .page_count(Path::new("/nonexistent/file.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[tokio::test]
    async fn test_corrupt_source_is_conversion_error() {
        let counter = PdfInfoPageCounter::new();
        if !counter.health_check().await.unwrap_or(false) {
            eprintln!("Skipping test: pdfinfo not installed");
            return;
        }
        let file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        std::fs::write(file.path(), b"not a pdf").unwrap();

        let err = counter.page_count(file.path()).await.unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[tokio::test]
    async fn test_health_check_does_not_error() {
        let counter = PdfInfoPageCounter::new().with_bin("definitely-not-pdfinfo");
        assert!(!counter.health_check().await.unwrap());
    }
}
