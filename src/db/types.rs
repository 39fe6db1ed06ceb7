use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "cefrlevel", rename_all = "lowercase")]
pub(crate) enum CefrLevel {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl CefrLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::A1 => "a1",
            Self::A2 => "a2",
            Self::B1 => "b1",
            Self::B2 => "b2",
            Self::C1 => "c1",
            Self::C2 => "c2",
        }
    }
}

impl FromStr for CefrLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "a1" => Ok(Self::A1),
            "a2" => Ok(Self::A2),
            "b1" => Ok(Self::B1),
            "b2" => Ok(Self::B2),
            "c1" => Ok(Self::C1),
            "c2" => Ok(Self::C2),
            other => Err(format!("Unknown level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "workflowkind", rename_all = "lowercase")]
pub(crate) enum WorkflowKind {
    Writing,
    Presentation,
}

impl WorkflowKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Writing => "writing",
            Self::Presentation => "presentation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "provenance", rename_all = "lowercase")]
pub(crate) enum Provenance {
    Generated,
    Fallback,
}

/// A (level, language) pair; the unit of caching, eligibility and history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct Category {
    pub(crate) level: CefrLevel,
    pub(crate) language: String,
}

impl Category {
    pub(crate) fn parse(level: &str, language: &str) -> Result<Self, String> {
        let level = level.parse::<CefrLevel>()?;
        let language = language.trim().to_ascii_lowercase();
        let valid = (2..=3).contains(&language.len())
            && language.chars().all(|ch| ch.is_ascii_lowercase());
        if !valid {
            return Err(format!("Invalid language code '{language}'"));
        }

        Ok(Self { level, language })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level.as_str(), self.language)
    }
}
