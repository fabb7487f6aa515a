use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::store::{PersistenceCategory, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    Preparation,
    Preflight,
    Resolution,
    Coercion,
    Persistence,
    NotExecuted,
    UnknownColumn,
    RowLimit,
    FilteredRows,
    InvertedExtraFields,
    SheetSkipped,
    Integration,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::Preparation => "preparation_error",
            DiagnosticCode::Preflight => "preflight_error",
            DiagnosticCode::Resolution => "resolution_error",
            DiagnosticCode::Coercion => "coercion_error",
            DiagnosticCode::Persistence => "persistence_error",
            DiagnosticCode::NotExecuted => "not_executed",
            DiagnosticCode::UnknownColumn => "unknown_column",
            DiagnosticCode::RowLimit => "row_limit",
            DiagnosticCode::FilteredRows => "filtered_rows",
            DiagnosticCode::InvertedExtraFields => "inverted_extra_fields",
            DiagnosticCode::SheetSkipped => "sheet_skipped",
            DiagnosticCode::Integration => "integration_error",
        }
    }
}

/// Machine-readable error or warning with enough context to place it in a grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_number: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sheet: None,
            row_number: None,
            field: None,
            details: BTreeMap::new(),
        }
    }

    pub fn sheet(mut self, sheet: &str) -> Self {
        self.sheet = Some(sheet.to_string());
        self
    }

    pub fn row(mut self, row_number: usize) -> Self {
        self.row_number = Some(row_number);
        self
    }

    pub fn field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code.as_str())?;
        if let Some(sheet) = &self.sheet {
            write!(f, " {sheet}")?;
            if let Some(row) = self.row_number {
                write!(f, ":{row}")?;
            }
        }
        if let Some(field) = &self.field {
            write!(f, " ({field})")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Sheet- and row-level failures. These are collected into the report rather
/// than returned to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    #[error("sheet '{sheet}': {message}")]
    Preparation {
        sheet: String,
        message: String,
        suggestions: BTreeMap<String, Vec<String>>,
    },
    #[error("missing required field(s): {}", .missing.join(", "))]
    Preflight { missing: Vec<String> },
    #[error("reference '{token}' in '{field}' did not resolve to any row imported so far")]
    Resolution {
        field: String,
        token: String,
        known_tokens: Vec<String>,
    },
    #[error("'{field}': {message}")]
    Coercion { field: String, message: String },
    #[error("{}: {source}", .source.category().friendly_message())]
    Persistence {
        #[source]
        source: StoreError,
    },
}

impl ImportError {
    pub fn code(&self) -> DiagnosticCode {
        match self {
            ImportError::Preparation { .. } => DiagnosticCode::Preparation,
            ImportError::Preflight { .. } => DiagnosticCode::Preflight,
            ImportError::Resolution { .. } => DiagnosticCode::Resolution,
            ImportError::Coercion { .. } => DiagnosticCode::Coercion,
            ImportError::Persistence { .. } => DiagnosticCode::Persistence,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            ImportError::Resolution { field, .. } | ImportError::Coercion { field, .. } => Some(field),
            ImportError::Preflight { missing } => missing.first().map(String::as_str),
            ImportError::Persistence { source } => source.field(),
            ImportError::Preparation { .. } => None,
        }
    }

    pub fn category(&self) -> Option<PersistenceCategory> {
        match self {
            ImportError::Persistence { source } => Some(source.category()),
            _ => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diagnostic = Diagnostic::new(self.code(), self.to_string());
        if let Some(field) = self.field() {
            diagnostic = diagnostic.field(field);
        }
        match self {
            ImportError::Preparation { sheet, suggestions, .. } => {
                diagnostic = diagnostic.sheet(sheet);
                if !suggestions.is_empty() {
                    diagnostic = diagnostic.detail(
                        "suggestions",
                        serde_json::to_value(suggestions).unwrap_or_default(),
                    );
                }
            }
            ImportError::Preflight { missing } => {
                diagnostic = diagnostic.detail("missing", missing.clone());
            }
            ImportError::Resolution { token, known_tokens, .. } => {
                diagnostic = diagnostic
                    .detail("token", token.clone())
                    .detail("known_tokens", known_tokens.clone());
            }
            ImportError::Persistence { source } => {
                diagnostic = diagnostic
                    .detail("category", source.category().as_str())
                    .detail("technical", source.to_string());
            }
            ImportError::Coercion { .. } => {}
        }
        diagnostic
    }
}

impl From<StoreError> for ImportError {
    fn from(source: StoreError) -> Self {
        ImportError::Persistence { source }
    }
}
