use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One manifest line: path components followed by the class label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabeledRecord {
    pub tokens: Vec<String>,
    pub label: String,
}

impl LabeledRecord {
    /// Parse a whitespace-delimited line; the last token is the label.
    ///
    /// Returns `None` for blank lines only. Positions are not validated.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
        let label = tokens.pop()?;
        Some(Self { tokens, label })
    }

    pub fn new(file: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            tokens: vec![file.into()],
            label: label.into(),
        }
    }

    /// Image file name relative to the data directory (token before the label).
    pub fn file_name(&self) -> Option<&str> {
        self.tokens.last().map(String::as_str)
    }

    pub fn image_path(&self, data_dir: &Path) -> Option<PathBuf> {
        self.file_name().map(|name| data_dir.join(name))
    }
}

pub fn parse_manifest(text: &str) -> Vec<LabeledRecord> {
    text.lines().filter_map(LabeledRecord::parse).collect()
}

pub fn read_manifest(path: &Path) -> Result<Vec<LabeledRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {:?}", path))?;
    let records = parse_manifest(&text);
    debug!("Read {} records from {:?}", records.len(), path);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_last_token() {
        let record = LabeledRecord::parse("P001 img_01.png positive\n").unwrap();
        assert_eq!(record.label, "positive");
        assert_eq!(record.file_name(), Some("img_01.png"));
        assert_eq!(record.tokens, vec!["P001", "img_01.png"]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let records = parse_manifest("a.png negative\n\n   \nb.png positive\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label, "positive");
    }

    #[test]
    fn test_single_token_line_has_no_file() {
        let record = LabeledRecord::parse("negative").unwrap();
        assert_eq!(record.label, "negative");
        assert!(record.file_name().is_none());
    }

    #[test]
    fn test_image_path_joins_data_dir() {
        let record = LabeledRecord::new("x.png", "negative");
        assert_eq!(
            record.image_path(Path::new("/data")),
            Some(PathBuf::from("/data/x.png"))
        );
    }
}
