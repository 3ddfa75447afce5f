//! Opt-in preview features a project can enable

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A capability that must be explicitly enabled in the project before
/// services may declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreviewFeature {
    SqlDatabases,
    Websockets,
    Http,
}

impl PreviewFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewFeature::SqlDatabases => "sql-databases",
            PreviewFeature::Websockets => "websockets",
            PreviewFeature::Http => "http",
        }
    }
}

impl fmt::Display for PreviewFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreviewFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sql-databases" => Ok(PreviewFeature::SqlDatabases),
            "websockets" => Ok(PreviewFeature::Websockets),
            "http" => Ok(PreviewFeature::Http),
            other => Err(format!(
                "unknown preview feature '{}'. Valid options: sql-databases, websockets, http",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preview_feature() {
        assert_eq!(
            "sql-databases".parse::<PreviewFeature>().unwrap(),
            PreviewFeature::SqlDatabases
        );
        assert_eq!(
            " Websockets ".parse::<PreviewFeature>().unwrap(),
            PreviewFeature::Websockets
        );
        assert!("databases".parse::<PreviewFeature>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for feature in [
            PreviewFeature::SqlDatabases,
            PreviewFeature::Websockets,
            PreviewFeature::Http,
        ] {
            assert_eq!(feature.to_string().parse::<PreviewFeature>().unwrap(), feature);
        }
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&PreviewFeature::SqlDatabases).unwrap();
        assert_eq!(json, "\"sql-databases\"");
    }
}
