//! Feature rankings file.
//!
//! Workers use the rankings to decide which metric movements matter. The file
//! is a CSV export handed to them verbatim; only the header is checked.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ServiceError;

/// Columns the rankings export must carry.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    "featurename",
    "semanticid",
    "definitiontag",
    "feature_rank",
    "importance",
];

/// Locations searched when no path is configured.
pub const DEFAULT_LOCATIONS: [&str; 2] = ["feature_rankings.csv", "data/feature_rankings.csv"];

/// Validated rankings content.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRankings {
    content: String,
    entries: usize,
}

impl FeatureRankings {
    /// Validate CSV text.
    pub fn parse(content: &str) -> Result<Self, ServiceError> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| ServiceError::Rankings("file is empty".to_string()))?;

        let columns: Vec<String> = header
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_ascii_lowercase())
            .collect();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|required| !columns.iter().any(|c| c == required))
            .collect();
        if !missing.is_empty() {
            return Err(ServiceError::Rankings(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            content: content.trim_end().to_string(),
            entries: lines.count(),
        })
    }

    /// Read and validate a rankings file.
    pub async fn load(path: &Path) -> Result<Self, ServiceError> {
        debug!(path = %path.display(), "Loading feature rankings");
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load from `path`, or from the first default location that exists.
    pub async fn locate(path: Option<&Path>) -> Result<Self, ServiceError> {
        if let Some(path) = path {
            return Self::load(path).await;
        }
        for candidate in DEFAULT_LOCATIONS.iter().map(PathBuf::from) {
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Self::load(&candidate).await;
            }
        }
        Err(ServiceError::Rankings(format!(
            "no rankings file found (looked in {})",
            DEFAULT_LOCATIONS.join(", ")
        )))
    }

    /// Number of data rows.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Text handed to workers.
    pub fn render(&self) -> String {
        format!(
            "Feature Rankings Data ({} entries):\n{}",
            self.entries, self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "featurename,semanticid,definitiontag,feature_rank,importance\n\
                       fuel,1,poi.fuel,1,0.9\n\
                       parking,2,poi.parking,2,0.7\n";

    #[test]
    fn test_parse_counts_entries() {
        let rankings = FeatureRankings::parse(CSV).unwrap();
        assert_eq!(rankings.entries(), 2);
        assert!(rankings
            .render()
            .starts_with("Feature Rankings Data (2 entries):\nfeaturename"));
    }

    #[test]
    fn test_parse_missing_columns() {
        let err = FeatureRankings::parse("featurename,importance\nfuel,1\n").unwrap_err();
        assert!(err.to_string().contains("semanticid"));
        assert!(FeatureRankings::parse("").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();

        let rankings = FeatureRankings::locate(Some(file.path())).await.unwrap();
        assert_eq!(rankings.entries(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = FeatureRankings::load(Path::new("/nonexistent/rankings.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Io(_)));
    }
}
