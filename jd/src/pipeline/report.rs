//! The structured report the model returns each iteration

use knowledgestore::{Entity, Relationship};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::is_pass_status;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no JSON object in model output")]
    NoJson,

    #[error("malformed step report: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A file the pipeline should write under the job's output directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutput {
    /// Relative path; absolute paths and `..` are refused
    pub path: String,
    pub content: String,
}

/// One iteration's result, as reported by the model
///
/// ```json
/// {
///   "status": "fail",
///   "feedback": {"issues": ["missing sources for claim 2"]},
///   "entities": [{"id": "acme", "kind": "company", "name": "Acme"}],
///   "relationships": [{"source": "acme", "target": "widgets", "kind": "sells"}],
///   "files": [{"path": "report.md", "content": "..."}],
///   "summary": "first draft"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub status: String,
    #[serde(default)]
    pub feedback: Value,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub files: Vec<FileOutput>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl StepReport {
    /// Parse model output, tolerating code fences and surrounding prose
    pub fn parse(text: &str) -> Result<Self, ReportError> {
        debug!(len = text.len(), "StepReport::parse: called");
        let start = text.find('{').ok_or(ReportError::NoJson)?;
        let end = text.rfind('}').ok_or(ReportError::NoJson)?;
        if end < start {
            return Err(ReportError::NoJson);
        }
        Ok(serde_json::from_str(&text[start..=end])?)
    }

    /// Stand-in report for output that could not be parsed
    ///
    /// Its feedback is the parse error, so a model that keeps producing the
    /// same broken output trips the retry-loop detector.
    pub fn invalid(error: &ReportError) -> Self {
        Self {
            status: "invalid".to_string(),
            feedback: Value::String(error.to_string()),
            entities: Vec::new(),
            relationships: Vec::new(),
            files: Vec::new(),
            summary: None,
        }
    }

    pub fn is_pass(&self) -> bool {
        is_pass_status(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_output() {
        let text = "Here you go:\n```json\n{\"status\": \"pass\", \"files\": [{\"path\": \"a.md\", \"content\": \"# A\"}]}\n```\n";
        let report = StepReport::parse(text).unwrap();
        assert!(report.is_pass());
        assert_eq!(report.files[0].path, "a.md");
        assert!(report.entities.is_empty());
        assert_eq!(report.feedback, Value::Null);
    }

    #[test]
    fn test_parse_entities() {
        let text = r#"{"status": "fail", "feedback": ["x"], "entities": [{"id": "e1", "kind": "k", "name": "E"}],
            "relationships": [{"source": "e1", "target": "e2", "kind": "rel"}]}"#;
        let report = StepReport::parse(text).unwrap();
        assert!(!report.is_pass());
        assert_eq!(report.entities[0].id, "e1");
        assert_eq!(report.relationships[0].kind, "rel");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(StepReport::parse("no json here"), Err(ReportError::NoJson)));
        assert!(matches!(StepReport::parse("} {"), Err(ReportError::NoJson)));
        let err = StepReport::parse("{\"feedback\": 1}").unwrap_err();
        assert!(matches!(err, ReportError::Malformed(_)));

        let invalid = StepReport::invalid(&err);
        assert_eq!(invalid.status, "invalid");
        assert!(invalid.feedback.as_str().unwrap().contains("status"));
    }
}
