//! Abstract Syntax Tree types for mlld documents
//!
//! A document is plain text interleaved with slash-directives. The parser
//! produces a flat list of content nodes; directive payloads are typed
//! expression trees. Every node carries a `SourceLocation` and directives
//! additionally carry a unique `node_id` used by the evaluator's memo cache.

use crate::error::SourceLocation;

/// Unique id assigned to directive nodes at parse time
pub type NodeId = u32;

/// A complete parsed document
#[derive(Debug, Clone)]
pub struct Document {
    pub nodes: Vec<Node>,
    /// Leading `---` YAML block, if any
    pub frontmatter: Option<FrontmatterNode>,
}

// ============ CONTENT NODES ============

#[derive(Debug, Clone)]
pub enum Node {
    Text(TextNode),
    Newline(SourceLocation),
    Comment(CommentNode),
    CodeFence(CodeFenceNode),
    Frontmatter(FrontmatterNode),
    Directive(DirectiveNode),
}

impl Node {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Node::Text(n) => &n.location,
            Node::Newline(loc) => loc,
            Node::Comment(n) => &n.location,
            Node::CodeFence(n) => &n.location,
            Node::Frontmatter(n) => &n.location,
            Node::Directive(n) => &n.location,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextNode {
    pub content: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct CommentNode {
    pub content: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct CodeFenceNode {
    pub language: Option<String>,
    pub content: String,
    /// Fence lines included, for identity re-emission
    pub raw: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct FrontmatterNode {
    /// Raw YAML between the `---` markers
    pub raw: String,
    pub location: SourceLocation,
}

// ============ EXPRESSIONS ============

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(LiteralNode),
    Template(TemplateNode),
    VarRef(VarRefNode),
    Object(ObjectNode),
    Array(ArrayNode),
    Binary(BinaryNode),
    Unary(UnaryNode),
    Ternary(TernaryNode),
    ExecInvocation(ExecInvocationNode),
    When(WhenExprNode),
    For(ForExprNode),
    FileRef(FileRefNode),
    Run(RunNode),
    /// `retry`/`skip`/`done` control returns inside when-actions
    Control(ControlNode),
    /// `head | @stage1 | show "..." | @stage2` pipeline chain
    Piped(PipedNode),
}

/// An expression with trailing pipeline stages
#[derive(Debug, Clone)]
pub struct PipedNode {
    pub head: Box<Expr>,
    pub stages: Vec<StageAst>,
    pub location: SourceLocation,
}

impl Expr {
    pub fn location(&self) -> &SourceLocation {
        match self {
            Expr::Literal(n) => &n.location,
            Expr::Template(n) => &n.location,
            Expr::VarRef(n) => &n.location,
            Expr::Object(n) => &n.location,
            Expr::Array(n) => &n.location,
            Expr::Binary(n) => &n.location,
            Expr::Unary(n) => &n.location,
            Expr::Ternary(n) => &n.location,
            Expr::ExecInvocation(n) => &n.location,
            Expr::When(n) => &n.location,
            Expr::For(n) => &n.location,
            Expr::FileRef(n) => &n.location,
            Expr::Run(n) => &n.location,
            Expr::Control(n) => &n.location,
            Expr::Piped(n) => &n.location,
        }
    }

    /// True when evaluation can never run a command, pipeline, or load, and
    /// never reads a binding (whose value could differ between evaluations).
    /// Only such closed expressions are eligible for the memo cache.
    pub fn is_referentially_pure(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Template(t) => t
                .parts
                .iter()
                .all(|p| matches!(p, TemplatePart::Text(_))),
            Expr::VarRef(_) => false,
            Expr::Object(o) => o.entries.iter().all(|(_, e)| e.is_referentially_pure()),
            Expr::Array(a) => a.elements.iter().all(Expr::is_referentially_pure),
            Expr::Binary(b) => b.left.is_referentially_pure() && b.right.is_referentially_pure(),
            Expr::Unary(u) => u.operand.is_referentially_pure(),
            Expr::Ternary(t) => {
                t.condition.is_referentially_pure()
                    && t.then_branch.is_referentially_pure()
                    && t.else_branch.is_referentially_pure()
            }
            Expr::ExecInvocation(_)
            | Expr::When(_)
            | Expr::For(_)
            | Expr::FileRef(_)
            | Expr::Run(_)
            | Expr::Control(_)
            | Expr::Piped(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, Clone)]
pub struct LiteralNode {
    pub value: LiteralValue,
    pub location: SourceLocation,
}

/// Backtick or `::...::` template with `@var` interpolation
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub parts: Vec<TemplatePart>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum TemplatePart {
    Text(String),
    Var(VarRefNode),
    Exec(ExecInvocationNode),
}

/// `@name` with optional field chain and condensed pipes:
/// `@user.profile.name | @upper`
#[derive(Debug, Clone)]
pub struct VarRefNode {
    pub identifier: String,
    pub fields: Vec<FieldAccess>,
    pub pipes: Vec<CondensedPipe>,
    pub location: SourceLocation,
}

impl VarRefNode {
    pub fn plain(identifier: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            identifier: identifier.into(),
            fields: Vec::new(),
            pipes: Vec::new(),
            location,
        }
    }
}

/// One step of a field-access chain, applied left-to-right
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAccess {
    /// `.name`
    Field(String),
    /// `[2]`, `.2`, negative counts from the end
    Index(i64),
    /// `["some key"]`
    StringKey(String),
}

/// `... | @fn(args)` suffix; always evaluated after field access
#[derive(Debug, Clone)]
pub struct CondensedPipe {
    pub name: String,
    pub args: Vec<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ObjectNode {
    pub entries: Vec<(String, Expr)>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct ArrayNode {
    pub elements: Vec<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct BinaryNode {
    pub op: BinaryOp,
    pub left: Box<Expr>,
    pub right: Box<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!cond`
    Not,
    /// `-num`
    Neg,
}

#[derive(Debug, Clone)]
pub struct UnaryNode {
    pub op: UnaryOp,
    pub operand: Box<Expr>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct TernaryNode {
    pub condition: Box<Expr>,
    pub then_branch: Box<Expr>,
    pub else_branch: Box<Expr>,
    pub location: SourceLocation,
}

/// `@fn(arg1, arg2).field` with an optional trailing `with { ... }` clause.
/// `callee_fields` select the executable before the call (`@ns.fn(...)`);
/// `fields` apply to the result afterwards.
#[derive(Debug, Clone)]
pub struct ExecInvocationNode {
    pub name: String,
    pub callee_fields: Vec<FieldAccess>,
    pub args: Vec<Expr>,
    pub fields: Vec<FieldAccess>,
    pub pipes: Vec<CondensedPipe>,
    pub with: Option<WithClause>,
    pub location: SourceLocation,
}

/// `with { pipeline: [...], format: "json", timeout: 5000 }`
#[derive(Debug, Clone, Default)]
pub struct WithClause {
    pub pipeline: Vec<StageAst>,
    pub format: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// One pipeline stage as parsed
#[derive(Debug, Clone)]
pub enum StageAst {
    /// `| @fn(args)`; effect stages (`@log`) do not count toward indices
    Call {
        name: String,
        args: Vec<Expr>,
        format: Option<String>,
        location: SourceLocation,
    },
    /// `| show "template"` inline effect, replayed once per attempt
    Show {
        template: TemplateNode,
        location: SourceLocation,
    },
}

impl StageAst {
    pub fn location(&self) -> &SourceLocation {
        match self {
            StageAst::Call { location, .. } | StageAst::Show { location, .. } => location,
        }
    }

    /// Effect stages are observed but never consume a stage index
    pub fn is_effect(&self) -> bool {
        match self {
            StageAst::Show { .. } => true,
            StageAst::Call { name, .. } => name == "log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenModifier {
    /// Stop after the first truthy condition
    First,
    /// Boolean OR over the conditions
    Any,
    /// Boolean AND over the conditions
    All,
}

#[derive(Debug, Clone)]
pub enum WhenCondition {
    Expr(Expr),
    /// `*` matches unconditionally
    Wildcard,
    /// `none` fires only when no prior condition matched
    None,
}

#[derive(Debug, Clone)]
pub struct WhenArm {
    pub condition: WhenCondition,
    pub action: Expr,
}

#[derive(Debug, Clone)]
pub struct WhenExprNode {
    pub modifier: Option<WhenModifier>,
    pub arms: Vec<WhenArm>,
    pub location: SourceLocation,
}

/// `for [parallel(N)] @x in @xs => body`
#[derive(Debug, Clone)]
pub struct ForExprNode {
    pub binding: String,
    pub iterable: Box<Expr>,
    pub body: Box<Expr>,
    pub parallel: Option<usize>,
    pub location: SourceLocation,
}

/// Alligator content reference: `<docs/*.md # Usage>` etc.
#[derive(Debug, Clone)]
pub struct FileRefNode {
    pub source: String,
    pub section: Option<String>,
    /// `{ name, (usage) }` definition selectors
    pub selectors: Vec<AstSelector>,
    pub fields: Vec<FieldAccess>,
    pub pipes: Vec<CondensedPipe>,
    /// `as "pattern"` with `<>.fm.*`/`<>.relative`/`<>.content` placeholders
    pub rename: Option<String>,
    pub location: SourceLocation,
}

impl FileRefNode {
    pub fn has_glob(&self) -> bool {
        self.source.contains('*') || self.source.contains('?') || self.source.contains('[')
    }

    pub fn is_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }
}

/// One `{ ... }` selector entry; `usage` selects definitions that
/// reference the name rather than define it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstSelector {
    pub name: String,
    pub usage: bool,
}

/// `/run` payload, also usable as a right-hand side
#[derive(Debug, Clone)]
pub struct RunNode {
    pub mode: RunMode,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum RunMode {
    /// `run "shell command"` with interpolation
    Command { command: TemplateNode },
    /// `run js { ... }` inline host-language block
    Code { lang: String, code: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlKind {
    /// Rewind to the nearest retryable stage, with an optional hint
    Retry,
    /// Halt the pipeline, keeping the last good output
    Skip,
    /// Short-circuit the pipeline successfully
    Done,
}

#[derive(Debug, Clone)]
pub struct ControlNode {
    pub kind: ControlKind,
    pub hint: Option<Box<Expr>>,
    pub location: SourceLocation,
}

// ============ DIRECTIVES ============

#[derive(Debug, Clone)]
pub struct DirectiveNode {
    pub kind: DirectiveKind,
    pub node_id: NodeId,
    /// Directive text as written, for diagnostics
    pub raw: String,
    pub location: SourceLocation,
}

impl DirectiveNode {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            DirectiveKind::Var(_) => "var",
            DirectiveKind::Path(_) => "path",
            DirectiveKind::Show(_) => "show",
            DirectiveKind::Run(_) => "run",
            DirectiveKind::Exe(_) => "exe",
            DirectiveKind::Import(_) => "import",
            DirectiveKind::Output(_) => "output",
            DirectiveKind::When(_) => "when",
            DirectiveKind::For(_) => "for",
            DirectiveKind::Guard(_) => "guard",
            DirectiveKind::Bail(_) => "bail",
            DirectiveKind::Checkpoint(_) => "checkpoint",
            DirectiveKind::Export(_) => "export",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DirectiveKind {
    Var(VarDirective),
    Path(PathDirective),
    Show(ShowDirective),
    Run(RunDirective),
    Exe(ExeDirective),
    Import(ImportDirective),
    Output(OutputDirective),
    When(WhenDirective),
    For(ForDirective),
    Guard(GuardDirective),
    Bail(BailDirective),
    Checkpoint(CheckpointDirective),
    Export(ExportDirective),
}

/// `/checkpoint "name"`: label the most recent cached call so `--resume`
/// can target it by name
#[derive(Debug, Clone)]
pub struct CheckpointDirective {
    pub name: Expr,
}

/// `/var [label] @name = expr`
#[derive(Debug, Clone)]
pub struct VarDirective {
    pub name: String,
    /// Capability labels such as `secret`
    pub labels: Vec<String>,
    pub value: Expr,
}

/// `/path @name = "..."`
#[derive(Debug, Clone)]
pub struct PathDirective {
    pub name: String,
    pub value: Expr,
    pub must_exist: bool,
}

#[derive(Debug, Clone)]
pub struct ShowDirective {
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct RunDirective {
    pub run: RunNode,
    pub with: Option<WithClause>,
}

/// `/exe @name(p1, p2) = body`
#[derive(Debug, Clone)]
pub struct ExeDirective {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub body: ExeBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    /// `@p.keep`: pass StructuredValue wrappers through host boundaries intact
    pub keep: bool,
}

#[derive(Debug, Clone)]
pub enum ExeBody {
    Template(TemplateNode),
    Run(RunNode),
    /// Forward to another executable: `= @other(@p1, 42)`
    Ref(ExecInvocationNode),
    /// Template-returning cascade: `= when [...]`
    When(WhenExprNode),
}

/// `/import { a, b as c } from "./x.mld"` and friends
#[derive(Debug, Clone)]
pub struct ImportDirective {
    /// Unresolved source text: quoted path, `@user/module`, `@INPUT`, URL
    pub source: String,
    pub selection: ImportSelection,
}

#[derive(Debug, Clone)]
pub enum ImportSelection {
    Selected(Vec<ImportBinding>),
    All,
    Namespace(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub name: String,
    pub alias: Option<String>,
}

/// `/output @x to "file.txt"` / `to stdout` / `to env NAME`
#[derive(Debug, Clone)]
pub struct OutputDirective {
    pub source: Expr,
    pub target: OutputTarget,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    File(Expr),
    Stdout,
    Stderr,
    Env(String),
    Resolver(String),
    /// Explicit end-of-document marker; evaluation is a no-op
    Document,
}

/// `/when cond => action` or a `[...]` cascade block
#[derive(Debug, Clone)]
pub struct WhenDirective {
    pub modifier: Option<WhenModifier>,
    pub arms: Vec<WhenDirectiveArm>,
}

#[derive(Debug, Clone)]
pub struct WhenDirectiveArm {
    pub condition: WhenCondition,
    pub action: ActionNode,
}

/// A when/for body slot: either an expression or a nested directive
#[derive(Debug, Clone)]
pub enum ActionNode {
    Expr(Expr),
    Directive(Box<DirectiveNode>),
}

#[derive(Debug, Clone)]
pub struct ForDirective {
    pub binding: String,
    pub iterable: Expr,
    pub body: ActionNode,
    pub parallel: Option<usize>,
}

/// `/guard for <op> = when [...]`
#[derive(Debug, Clone)]
pub struct GuardDirective {
    pub op_type: String,
    pub subtype: Option<String>,
    pub arms: Vec<WhenArm>,
}

#[derive(Debug, Clone)]
pub struct BailDirective {
    pub message: Option<Expr>,
}

/// Explicit export manifest for a module
#[derive(Debug, Clone)]
pub struct ExportDirective {
    pub names: Vec<String>,
}

/// First char `[A-Za-z_]`, rest `[A-Za-z0-9_]`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("user"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("a-b"));
    }

    #[test]
    fn glob_detection() {
        let node = FileRefNode {
            source: "docs/*.md".into(),
            section: None,
            selectors: Vec::new(),
            fields: Vec::new(),
            pipes: Vec::new(),
            rename: None,
            location: SourceLocation::default(),
        };
        assert!(node.has_glob());
        assert!(!node.is_url());
    }
}
