//! Tagged variable records
//!
//! Every binding in an environment is a `Variable`: a kind discriminator, the
//! runtime value, and provenance metadata (where it was defined, whether it
//! was imported, security labels). Executable definitions live here too since
//! an `/exe` binding is just a variable of kind `Executable`.

use crate::ast::{ExeBody, ParamDecl};
use crate::env::EnvRef;
use crate::error::SourceLocation;
use crate::value::Value;

/// The 14 variable kinds of the data model, plus `Structured` for wrapped
/// content promoted to a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    SimpleText,
    InterpolatedText,
    Template,
    FileContent,
    SectionContent,
    Object,
    Array,
    Computed,
    CommandResult,
    Path,
    Imported,
    Executable,
    PipelineInput,
    Primitive,
    Structured,
}

impl VariableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableKind::SimpleText => "simple-text",
            VariableKind::InterpolatedText => "interpolated-text",
            VariableKind::Template => "template",
            VariableKind::FileContent => "file-content",
            VariableKind::SectionContent => "section-content",
            VariableKind::Object => "object",
            VariableKind::Array => "array",
            VariableKind::Computed => "computed",
            VariableKind::CommandResult => "command-result",
            VariableKind::Path => "path",
            VariableKind::Imported => "imported",
            VariableKind::Executable => "executable",
            VariableKind::PipelineInput => "pipeline-input",
            VariableKind::Primitive => "primitive",
            VariableKind::Structured => "structured",
        }
    }

    /// Kinds whose value is fundamentally a string
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            VariableKind::SimpleText
                | VariableKind::InterpolatedText
                | VariableKind::Template
                | VariableKind::FileContent
                | VariableKind::SectionContent
                | VariableKind::CommandResult
        )
    }

    pub fn is_structured_kind(self) -> bool {
        matches!(
            self,
            VariableKind::Object | VariableKind::Array | VariableKind::Structured
        )
    }

    /// Kinds whose value originated outside the current document
    pub fn is_external(self) -> bool {
        matches!(
            self,
            VariableKind::FileContent
                | VariableKind::SectionContent
                | VariableKind::Imported
                | VariableKind::CommandResult
                | VariableKind::Computed
        )
    }
}

/// How the binding was written, for diagnostics and re-emission
#[derive(Debug, Clone, Default)]
pub struct VariableSource {
    pub directive: String,
    pub syntax: String,
    pub has_interpolation: bool,
    pub is_multi_line: bool,
}

/// Element discipline for arrays that need special display/bridge handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayType {
    LoadContentResult,
    RenamedContent,
    Structured,
}

#[derive(Debug, Clone, Default)]
pub struct VariableMetadata {
    pub defined_at: Option<SourceLocation>,
    pub is_imported: bool,
    /// Import site, kept so diagnostics point at the `/import` line
    pub import_path: Option<String>,
    pub is_system: bool,
    pub is_complex: bool,
    /// Capability labels attached via `/var secret @x = ...`
    pub security: Vec<String>,
    pub array_type: Option<ArrayType>,
    /// For pipeline-input variables: the declared format hint and raw text
    pub pipeline_format: Option<String>,
    pub pipeline_raw: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: VariableKind,
    pub name: String,
    pub value: Value,
    pub source: VariableSource,
    pub metadata: VariableMetadata,
}

impl Variable {
    pub fn new(kind: VariableKind, name: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
            source: VariableSource::default(),
            metadata: VariableMetadata::default(),
        }
    }

    pub fn simple_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(VariableKind::SimpleText, name, Value::Text(text.into()))
    }

    pub fn primitive(name: impl Into<String>, value: Value) -> Self {
        Self::new(VariableKind::Primitive, name, value)
    }

    pub fn command_result(name: impl Into<String>, value: Value) -> Self {
        Self::new(VariableKind::CommandResult, name, value)
    }

    pub fn executable(name: impl Into<String>, value: Value) -> Self {
        Self::new(VariableKind::Executable, name, value)
    }

    /// The `@input` binding inside a pipeline stage frame
    pub fn pipeline_input(value: Value, format: Option<String>, raw: String) -> Self {
        let mut var = Self::new(VariableKind::PipelineInput, "input", value);
        var.metadata.pipeline_format = format;
        var.metadata.pipeline_raw = Some(raw);
        var
    }

    /// System-provided bindings (`@mx`, `@ctx`, `@p`) that user code cannot
    /// shadow accidentally
    pub fn system(name: impl Into<String>, value: Value) -> Self {
        let mut var = Self::new(VariableKind::Computed, name, value);
        var.metadata.is_system = true;
        var
    }

    /// Infer a binding kind from the shape of an evaluated value
    pub fn inferred(name: impl Into<String>, value: Value) -> Self {
        let kind = match &value {
            Value::Null | Value::Bool(_) | Value::Number(_) => VariableKind::Primitive,
            Value::Text(_) => VariableKind::SimpleText,
            Value::Array(_) => VariableKind::Array,
            Value::Object(_) => VariableKind::Object,
            Value::Path(_) => VariableKind::Path,
            Value::Executable(_) => VariableKind::Executable,
            Value::Structured(_) => VariableKind::Structured,
            Value::Control(_) => VariableKind::Computed,
        };
        Self::new(kind, name, value)
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.metadata.defined_at = Some(location);
        self
    }

    pub fn with_source(mut self, source: VariableSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.metadata.security = labels;
        self
    }

    /// Re-create this variable as seen through an import
    pub fn rehomed(&self, new_name: impl Into<String>, import_path: impl Into<String>) -> Self {
        let mut var = self.clone();
        var.name = new_name.into();
        var.metadata.is_imported = true;
        var.metadata.import_path = Some(import_path.into());
        var
    }

    pub fn is_executable(&self) -> bool {
        self.kind == VariableKind::Executable
    }
}

/// A user-defined executable stored by `/exe`
#[derive(Debug, Clone)]
pub struct ExecutableDef {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub body: ExeBody,
    /// Definition environment for lexical resolution at call time
    pub captured: Option<EnvRef>,
    pub location: SourceLocation,
}

impl ExecutableDef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}
