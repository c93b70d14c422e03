//! Parser for mlld documents
//!
//! Two layers. The document scanner splits source into plain text, blank
//! lines, comments, fences, frontmatter, and directives; only directive text
//! is tokenized. Directives are parsed by recursive descent with precedence
//! climbing for binary expressions, resuming document scanning at the first
//! token past the directive.

use crate::ast::*;
use crate::error::{MlldError, SourceLocation};
use crate::lexer::{is_id_continue, is_id_start, Lexer, Token, TokenKind};

const DIRECTIVE_KEYWORDS: &[&str] = &[
    "var",
    "show",
    "run",
    "exe",
    "import",
    "output",
    "when",
    "for",
    "path",
    "guard",
    "bail",
    "checkpoint",
    "export",
];

/// Parse a complete document
pub fn parse_document(source: &str) -> Result<Document, MlldError> {
    parse_document_in(source, None)
}

/// Parse a document, attributing locations to `file`
pub fn parse_document_in(source: &str, file: Option<&str>) -> Result<Document, MlldError> {
    let mut nodes = Vec::new();
    let mut frontmatter = None;
    let mut next_id: NodeId = 1;

    let mut offset = 0usize;
    let mut line: u32 = 1;

    // Leading `---` YAML block
    if let Some(rest) = source.strip_prefix("---\n") {
        if let Some((yaml, consumed)) = frontmatter_block(rest) {
            let node = FrontmatterNode {
                raw: yaml.to_string(),
                location: locate(1, 1, 0, file),
            };
            frontmatter = Some(node.clone());
            nodes.push(Node::Frontmatter(node));
            offset = 4 + consumed;
            // Opening marker, yaml lines, closing marker
            line = yaml.lines().count() as u32 + 3;
        }
    }

    while offset < source.len() {
        let rest = source.get(offset..).unwrap_or("");
        let (line_text, has_newline) = match rest.split_once('\n') {
            Some((text, _)) => (text, true),
            None => (rest, false),
        };
        let line_advance = line_text.len() + usize::from(has_newline);
        let loc = locate(line, 1, offset, file);

        if line_text.trim().is_empty() {
            nodes.push(Node::Newline(loc));
            offset += line_advance;
            line += 1;
            continue;
        }

        if let Some(comment) = line_text.strip_prefix(">>") {
            nodes.push(Node::Comment(CommentNode {
                content: comment.trim().to_string(),
                location: loc,
            }));
            offset += line_advance;
            line += 1;
            continue;
        }

        if line_text.starts_with("```") || line_text.starts_with("~~~") {
            let (node, consumed_lines, new_offset) =
                scan_code_fence(source, offset, line, file)?;
            nodes.push(Node::CodeFence(node));
            line += consumed_lines;
            offset = new_offset;
            continue;
        }

        if starts_directive(line_text) {
            let mut parser = DirectiveParser::new(source, offset, line, 1, file);
            let directive = parser.parse_directive(&mut next_id)?;
            let (new_offset, new_line) = parser.finish_line()?;
            nodes.push(Node::Directive(directive));
            offset = new_offset;
            line = new_line;
            continue;
        }

        nodes.push(Node::Text(TextNode {
            content: line_text.to_string(),
            location: loc,
        }));
        offset += line_advance;
        line += 1;
    }

    Ok(Document { nodes, frontmatter })
}

fn locate(line: u32, column: u32, offset: usize, file: Option<&str>) -> SourceLocation {
    let loc = SourceLocation::new(line, column, offset);
    match file {
        Some(f) => loc.in_file(f),
        None => loc,
    }
}

/// The yaml body and length consumed past the opening marker, up to and
/// including the closing `---` line
fn frontmatter_block(rest: &str) -> Option<(&str, usize)> {
    let mut pos = 0usize;
    for l in rest.split_inclusive('\n') {
        if l.trim_end() == "---" {
            return rest.get(..pos).map(|yaml| (yaml, pos + l.len()));
        }
        pos += l.len();
    }
    None
}

fn scan_code_fence(
    source: &str,
    offset: usize,
    line: u32,
    file: Option<&str>,
) -> Result<(CodeFenceNode, u32, usize), MlldError> {
    let rest = source.get(offset..).unwrap_or("");
    let mut lines = rest.split_inclusive('\n');
    let open = lines.next().unwrap_or("");
    let marker: String = open.chars().take_while(|&c| c == '`' || c == '~').collect();
    let language = open.get(marker.len()..).map(str::trim).unwrap_or("");
    let language = if language.is_empty() {
        None
    } else {
        Some(language.to_string())
    };

    let mut consumed = open.len();
    let mut consumed_lines: u32 = 1;
    let mut content = String::new();
    let mut closed = false;
    for l in lines {
        consumed += l.len();
        consumed_lines += 1;
        if l.trim_end() == marker {
            closed = true;
            break;
        }
        content.push_str(l);
    }
    if !closed {
        return Err(MlldError::parse(
            "unterminated code fence",
            locate(line, 1, offset, file),
        ));
    }
    let raw = rest.get(..consumed).unwrap_or("").to_string();
    Ok((
        CodeFenceNode {
            language,
            content,
            raw,
            location: locate(line, 1, offset, file),
        },
        consumed_lines,
        offset + consumed,
    ))
}

fn starts_directive(line: &str) -> bool {
    let Some(rest) = line.strip_prefix('/') else {
        return false;
    };
    let keyword: String = rest.chars().take_while(|&c| is_id_continue(c)).collect();
    DIRECTIVE_KEYWORDS.contains(&keyword.as_str())
        && rest
            .chars()
            .nth(keyword.chars().count())
            .map_or(true, |c| !is_id_continue(c))
}

/// Token-level parser for one directive (and any directives nested in its
/// actions)
pub struct DirectiveParser<'a> {
    source: &'a str,
    file: Option<&'a str>,
    lexer: Lexer<'a>,
    current: Token,
    previous: Token,
}

impl<'a> DirectiveParser<'a> {
    pub fn new(
        source: &'a str,
        offset: usize,
        line: u32,
        column: u32,
        file: Option<&'a str>,
    ) -> Self {
        let mut lexer = Lexer::at(source, offset, line, column);
        let current = lexer.next_token();
        Self {
            source,
            file,
            lexer,
            current,
            previous: Token::eof(offset, line, column),
        }
    }

    /// After a completed directive: consume the line end and report where
    /// document scanning resumes
    fn finish_line(&mut self) -> Result<(usize, u32), MlldError> {
        match &self.current.kind {
            TokenKind::Newline => Ok((
                self.current.location.offset + 1,
                self.current.location.line + 1,
            )),
            TokenKind::Eof => Ok((self.current.location.offset, self.current.location.line)),
            other => Err(MlldError::parse_expecting(
                format!("unexpected {} after directive", other.describe()),
                vec!["end of line".to_string()],
                self.loc(&self.current),
            )),
        }
    }

    // ============ DIRECTIVES ============

    pub fn parse_directive(&mut self, ids: &mut NodeId) -> Result<DirectiveNode, MlldError> {
        let start = self.current.location.clone();
        self.expect(&TokenKind::Slash)?;
        let keyword = self.expect_identifier("directive name")?;
        let kind = match keyword.as_str() {
            "var" => self.parse_var(ids)?,
            "path" => self.parse_path()?,
            "show" => DirectiveKind::Show(ShowDirective {
                value: self.parse_expression()?,
            }),
            "run" => self.parse_run()?,
            "exe" => self.parse_exe()?,
            "import" => self.parse_import()?,
            "output" => self.parse_output()?,
            "when" => self.parse_when_directive(ids)?,
            "for" => self.parse_for_directive(ids)?,
            "guard" => self.parse_guard()?,
            "bail" => self.parse_bail()?,
            "checkpoint" => DirectiveKind::Checkpoint(CheckpointDirective {
                name: self.parse_expression()?,
            }),
            "export" => self.parse_export()?,
            other => {
                return Err(MlldError::parse_expecting(
                    format!("unknown directive /{other}"),
                    DIRECTIVE_KEYWORDS.iter().map(|k| format!("/{k}")).collect(),
                    start,
                ))
            }
        };
        let node_id = *ids;
        *ids += 1;
        let raw_end = self.current.location.offset;
        let raw = self
            .source
            .get(start.offset..raw_end)
            .unwrap_or("")
            .trim_end()
            .to_string();
        Ok(DirectiveNode {
            kind,
            node_id,
            raw,
            location: start,
        })
    }

    fn parse_var(&mut self, _ids: &mut NodeId) -> Result<DirectiveKind, MlldError> {
        let mut labels = Vec::new();
        while let TokenKind::Identifier(label) = &self.current.kind {
            labels.push(label.clone());
            self.advance();
        }
        self.expect(&TokenKind::At)?;
        let name = self.expect_identifier("variable name")?;
        self.expect(&TokenKind::Assign)?;
        let value = self.parse_expression()?;
        Ok(DirectiveKind::Var(VarDirective {
            name,
            labels,
            value,
        }))
    }

    fn parse_path(&mut self) -> Result<DirectiveKind, MlldError> {
        self.expect(&TokenKind::At)?;
        let name = self.expect_identifier("path name")?;
        self.expect(&TokenKind::Assign)?;
        let value = self.parse_expression()?;
        let must_exist = if self.check_identifier("exists") {
            self.advance();
            true
        } else {
            false
        };
        Ok(DirectiveKind::Path(PathDirective {
            name,
            value,
            must_exist,
        }))
    }

    fn parse_run(&mut self) -> Result<DirectiveKind, MlldError> {
        let run = self.parse_run_node()?;
        let mut with = None;
        let mut stages = Vec::new();
        while self.match_token(&TokenKind::Pipe) {
            stages.push(self.parse_stage()?);
        }
        if self.check_identifier("with") {
            with = Some(self.parse_with_clause()?);
        }
        let with = match (with, stages.is_empty()) {
            (Some(mut clause), false) => {
                clause.pipeline.extend(stages);
                Some(clause)
            }
            (Some(clause), true) => Some(clause),
            (None, false) => Some(WithClause {
                pipeline: stages,
                ..WithClause::default()
            }),
            (None, true) => None,
        };
        Ok(DirectiveKind::Run(RunDirective { run, with }))
    }

    fn parse_exe(&mut self) -> Result<DirectiveKind, MlldError> {
        self.expect(&TokenKind::At)?;
        let name = self.expect_identifier("executable name")?;
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let pname = self.expect_identifier("parameter name")?;
                let mut keep = false;
                if self.check(&TokenKind::Dot) {
                    self.advance();
                    let marker = self.expect_identifier("parameter marker")?;
                    if marker == "keep" {
                        keep = true;
                    } else {
                        return Err(MlldError::parse_expecting(
                            format!("unknown parameter marker .{marker}"),
                            vec![".keep".to_string()],
                            self.loc(&self.previous),
                        ));
                    }
                }
                params.push(ParamDecl { name: pname, keep });
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::Assign)?;
        let body = self.parse_exe_body()?;
        Ok(DirectiveKind::Exe(ExeDirective { name, params, body }))
    }

    fn parse_exe_body(&mut self) -> Result<ExeBody, MlldError> {
        match &self.current.kind.clone() {
            TokenKind::Template(raw) => {
                let loc = self.loc(&self.current);
                self.advance();
                Ok(ExeBody::Template(self.parse_template_raw(raw, loc)?))
            }
            TokenKind::DoubleString(raw) => {
                let loc = self.loc(&self.current);
                self.advance();
                Ok(ExeBody::Template(self.parse_template_raw(raw, loc)?))
            }
            TokenKind::String(text) => {
                let loc = self.loc(&self.current);
                self.advance();
                Ok(ExeBody::Template(TemplateNode {
                    parts: vec![TemplatePart::Text(text.clone())],
                    location: loc,
                }))
            }
            TokenKind::At => {
                let expr = self.parse_at_expression()?;
                match expr {
                    Expr::ExecInvocation(inv) => Ok(ExeBody::Ref(inv)),
                    Expr::VarRef(var) => Ok(ExeBody::Ref(ExecInvocationNode {
                        name: var.identifier,
                        callee_fields: var.fields,
                        args: Vec::new(),
                        fields: Vec::new(),
                        pipes: var.pipes,
                        with: None,
                        location: var.location,
                    })),
                    other => Err(MlldError::parse(
                        "executable body reference must name another executable",
                        other.location().clone(),
                    )),
                }
            }
            TokenKind::Identifier(word) if word == "when" => {
                let loc = self.loc(&self.current);
                self.advance();
                Ok(ExeBody::When(self.parse_when_expr_tail(loc)?))
            }
            TokenKind::Identifier(word) if word == "run" || is_known_language(word) => {
                Ok(ExeBody::Run(self.parse_run_node()?))
            }
            other => Err(MlldError::parse_expecting(
                format!("unexpected {} in executable body", other.describe()),
                vec![
                    "template".to_string(),
                    "run".to_string(),
                    "when".to_string(),
                    "@reference".to_string(),
                ],
                self.loc(&self.current),
            )),
        }
    }

    fn parse_import(&mut self) -> Result<DirectiveKind, MlldError> {
        if self.check(&TokenKind::LBrace) {
            self.advance();
            self.skip_newlines();
            let mut bindings = Vec::new();
            while !self.check(&TokenKind::RBrace) {
                self.match_token(&TokenKind::At);
                let name = self.expect_identifier("import name")?;
                let alias = if self.check_identifier("as") {
                    self.advance();
                    self.match_token(&TokenKind::At);
                    Some(self.expect_identifier("import alias")?)
                } else {
                    None
                };
                bindings.push(ImportBinding { name, alias });
                self.skip_newlines();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.expect(&TokenKind::RBrace)?;
            self.expect_keyword("from")?;
            let source = self.parse_import_source()?;
            return Ok(DirectiveKind::Import(ImportDirective {
                source,
                selection: ImportSelection::Selected(bindings),
            }));
        }

        let source = self.parse_import_source()?;
        if self.check_identifier("as") {
            self.advance();
            self.expect(&TokenKind::At)?;
            let ns = self.expect_identifier("namespace name")?;
            return Ok(DirectiveKind::Import(ImportDirective {
                source,
                selection: ImportSelection::Namespace(ns),
            }));
        }
        Ok(DirectiveKind::Import(ImportDirective {
            source,
            selection: ImportSelection::All,
        }))
    }

    fn parse_import_source(&mut self) -> Result<String, MlldError> {
        match &self.current.kind.clone() {
            TokenKind::String(s) | TokenKind::DoubleString(s) => {
                self.advance();
                Ok(s.clone())
            }
            TokenKind::At => {
                self.advance();
                let mut source = String::from("@");
                source.push_str(&self.expect_identifier("module reference")?);
                if self.match_token(&TokenKind::Slash) {
                    source.push('/');
                    source.push_str(&self.expect_identifier("module name")?);
                }
                Ok(source)
            }
            TokenKind::Lt => {
                let lt = self.current.clone();
                let token = self.lexer.rescan_as_alligator(&lt);
                let TokenKind::Alligator(inner) = &token.kind else {
                    return Err(MlldError::parse(
                        "unterminated import source",
                        self.loc(&lt),
                    ));
                };
                let inner = inner.trim().to_string();
                self.current = self.lexer.next_token();
                Ok(inner)
            }
            other => Err(MlldError::parse_expecting(
                format!("unexpected {} as import source", other.describe()),
                vec!["path".to_string(), "@module".to_string()],
                self.loc(&self.current),
            )),
        }
    }

    fn parse_output(&mut self) -> Result<DirectiveKind, MlldError> {
        let source = self.parse_expression()?;
        self.expect_keyword("to")?;
        let target = match &self.current.kind.clone() {
            TokenKind::String(_) | TokenKind::DoubleString(_) | TokenKind::Template(_) => {
                OutputTarget::File(self.parse_expression()?)
            }
            TokenKind::At => {
                self.advance();
                let name = self.expect_identifier("resolver name")?;
                OutputTarget::Resolver(name)
            }
            TokenKind::Identifier(word) => match word.as_str() {
                "stdout" => {
                    self.advance();
                    OutputTarget::Stdout
                }
                "stderr" => {
                    self.advance();
                    OutputTarget::Stderr
                }
                "document" => {
                    self.advance();
                    OutputTarget::Document
                }
                "env" => {
                    self.advance();
                    let name = self.expect_identifier("environment variable name")?;
                    OutputTarget::Env(name)
                }
                other => {
                    return Err(MlldError::parse_expecting(
                        format!("unknown output target '{other}'"),
                        vec![
                            "file path".to_string(),
                            "stdout".to_string(),
                            "stderr".to_string(),
                            "env".to_string(),
                        ],
                        self.loc(&self.current),
                    ))
                }
            },
            other => {
                return Err(MlldError::parse_expecting(
                    format!("unexpected {} as output target", other.describe()),
                    vec!["file path".to_string(), "stream".to_string()],
                    self.loc(&self.current),
                ))
            }
        };
        let format = if self.check_identifier("as") {
            self.advance();
            Some(self.expect_identifier("output format")?)
        } else {
            None
        };
        Ok(DirectiveKind::Output(OutputDirective {
            source,
            target,
            format,
        }))
    }

    fn parse_when_directive(&mut self, ids: &mut NodeId) -> Result<DirectiveKind, MlldError> {
        let modifier = self.parse_when_modifier();
        if self.check(&TokenKind::LBracket) {
            self.advance();
            let mut arms = Vec::new();
            self.skip_newlines();
            while !self.check(&TokenKind::RBracket) {
                let condition = self.parse_when_condition()?;
                self.expect(&TokenKind::Arrow)?;
                let action = self.parse_action(ids)?;
                arms.push(WhenDirectiveArm { condition, action });
                self.skip_arm_separators();
            }
            self.expect(&TokenKind::RBracket)?;
            return Ok(DirectiveKind::When(WhenDirective { modifier, arms }));
        }
        // Simple form: /when cond => action
        let condition = WhenCondition::Expr(self.parse_expression()?);
        self.expect(&TokenKind::Arrow)?;
        let action = self.parse_action(ids)?;
        Ok(DirectiveKind::When(WhenDirective {
            modifier,
            arms: vec![WhenDirectiveArm { condition, action }],
        }))
    }

    fn parse_for_directive(&mut self, ids: &mut NodeId) -> Result<DirectiveKind, MlldError> {
        let parallel = self.parse_parallel_clause()?;
        self.expect(&TokenKind::At)?;
        let binding = self.expect_identifier("loop binding")?;
        self.expect_keyword("in")?;
        let iterable = self.parse_expression()?;
        self.expect(&TokenKind::Arrow)?;
        let body = self.parse_action(ids)?;
        Ok(DirectiveKind::For(ForDirective {
            binding,
            iterable,
            body,
            parallel,
        }))
    }

    fn parse_guard(&mut self) -> Result<DirectiveKind, MlldError> {
        self.expect_keyword("for")?;
        let op_type = self.expect_identifier("guard target")?;
        let subtype = if self.match_token(&TokenKind::Colon) {
            Some(self.expect_identifier("guard subtype")?)
        } else {
            None
        };
        self.expect(&TokenKind::Assign)?;
        self.expect_keyword("when")?;
        let loc = self.loc(&self.previous);
        let when = self.parse_when_expr_tail(loc)?;
        Ok(DirectiveKind::Guard(GuardDirective {
            op_type,
            subtype,
            arms: when.arms,
        }))
    }

    fn parse_bail(&mut self) -> Result<DirectiveKind, MlldError> {
        let message = if matches!(self.current.kind, TokenKind::Newline | TokenKind::Eof) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        Ok(DirectiveKind::Bail(BailDirective { message }))
    }

    fn parse_export(&mut self) -> Result<DirectiveKind, MlldError> {
        self.expect(&TokenKind::LBrace)?;
        let mut names = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            self.match_token(&TokenKind::At);
            names.push(self.expect_identifier("export name")?);
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(DirectiveKind::Export(ExportDirective { names }))
    }

    /// When/for action slot: a nested directive or an expression
    fn parse_action(&mut self, ids: &mut NodeId) -> Result<ActionNode, MlldError> {
        if self.check(&TokenKind::Slash) {
            let directive = self.parse_directive(ids)?;
            return Ok(ActionNode::Directive(Box::new(directive)));
        }
        if self.check_identifier("show") {
            // `=> show "..."` shorthand for a /show action
            let loc = self.loc(&self.current);
            self.advance();
            let value = self.parse_expression()?;
            return Ok(ActionNode::Directive(Box::new(DirectiveNode {
                kind: DirectiveKind::Show(ShowDirective { value }),
                node_id: 0,
                raw: String::new(),
                location: loc,
            })));
        }
        Ok(ActionNode::Expr(self.parse_expression()?))
    }

    // ============ EXPRESSIONS ============

    pub fn parse_expression(&mut self) -> Result<Expr, MlldError> {
        let expr = self.parse_ternary()?;
        if !self.check(&TokenKind::Pipe) {
            return Ok(expr);
        }
        let location = expr.location().clone();
        let mut stages = Vec::new();
        while self.match_token(&TokenKind::Pipe) {
            stages.push(self.parse_stage()?);
        }
        Ok(Expr::Piped(PipedNode {
            head: Box::new(expr),
            stages,
            location,
        }))
    }

    /// One `| ...` pipeline stage: `@fn(args)`, `show "..."`, or `log`
    fn parse_stage(&mut self) -> Result<StageAst, MlldError> {
        self.skip_newlines();
        if self.check_identifier("show") {
            let location = self.loc(&self.current);
            self.advance();
            let template = self.parse_inline_template()?;
            return Ok(StageAst::Show { template, location });
        }
        self.expect(&TokenKind::At)?;
        let location = self.loc(&self.previous);
        let name = self.expect_identifier("stage name")?;
        let mut args = Vec::new();
        if self.match_token(&TokenKind::LParen) {
            if !self.check(&TokenKind::RParen) {
                loop {
                    args.push(self.parse_expression()?);
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(&TokenKind::RParen)?;
        }
        Ok(StageAst::Call {
            name,
            args,
            format: None,
            location,
        })
    }

    fn parse_inline_template(&mut self) -> Result<TemplateNode, MlldError> {
        match &self.current.kind.clone() {
            TokenKind::DoubleString(raw) | TokenKind::Template(raw) => {
                let loc = self.loc(&self.current);
                self.advance();
                self.parse_template_raw(raw, loc)
            }
            TokenKind::String(text) => {
                let loc = self.loc(&self.current);
                self.advance();
                Ok(TemplateNode {
                    parts: vec![TemplatePart::Text(text.clone())],
                    location: loc,
                })
            }
            other => Err(MlldError::parse_expecting(
                format!("unexpected {}", other.describe()),
                vec!["string".to_string(), "template".to_string()],
                self.loc(&self.current),
            )),
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr, MlldError> {
        let condition = self.parse_binary(1)?;
        if !self.match_token(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_branch = self.parse_ternary()?;
        self.expect(&TokenKind::Colon)?;
        let else_branch = self.parse_ternary()?;
        let location = condition.location().clone();
        Ok(Expr::Ternary(TernaryNode {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
            location,
        }))
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, MlldError> {
        let mut left = self.parse_unary()?;
        loop {
            let Some((op, prec)) = binary_op(&self.current.kind) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            self.skip_newlines();
            let right = self.parse_binary(prec + 1)?;
            let location = left.location().clone();
            left = Expr::Binary(BinaryNode {
                op,
                left: Box::new(left),
                right: Box::new(right),
                location,
            });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, MlldError> {
        let op = match &self.current.kind {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            let location = self.loc(&self.current);
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryNode {
                op,
                operand: Box::new(operand),
                location,
            }));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, MlldError> {
        let loc = self.loc(&self.current);
        match &self.current.kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal(LiteralNode {
                    value: LiteralValue::Number(*n),
                    location: loc,
                }))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(LiteralNode {
                    value: LiteralValue::Bool(true),
                    location: loc,
                }))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(LiteralNode {
                    value: LiteralValue::Bool(false),
                    location: loc,
                }))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(LiteralNode {
                    value: LiteralValue::Null,
                    location: loc,
                }))
            }
            TokenKind::String(text) => {
                self.advance();
                Ok(Expr::Literal(LiteralNode {
                    value: LiteralValue::String(text.clone()),
                    location: loc,
                }))
            }
            TokenKind::DoubleString(raw) => {
                self.advance();
                let template = self.parse_template_raw(raw, loc.clone())?;
                Ok(collapse_template(template))
            }
            TokenKind::Template(raw) => {
                self.advance();
                let template = self.parse_template_raw(raw, loc)?;
                Ok(Expr::Template(template))
            }
            TokenKind::At => self.parse_at_expression(),
            TokenKind::LBrace => self.parse_object_literal(),
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.parse_expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Lt => self.parse_alligator(),
            TokenKind::Identifier(word) => match word.as_str() {
                "when" => {
                    self.advance();
                    let when = self.parse_when_expr_tail(loc)?;
                    Ok(Expr::When(when))
                }
                "for" => {
                    self.advance();
                    self.parse_for_expr(loc)
                }
                "run" => Ok(Expr::Run(self.parse_run_node()?)),
                "retry" => {
                    self.advance();
                    let hint = if matches!(
                        self.current.kind,
                        TokenKind::String(_)
                            | TokenKind::DoubleString(_)
                            | TokenKind::Template(_)
                            | TokenKind::LBrace
                    ) {
                        Some(Box::new(self.parse_primary()?))
                    } else {
                        None
                    };
                    Ok(Expr::Control(ControlNode {
                        kind: ControlKind::Retry,
                        hint,
                        location: loc,
                    }))
                }
                "skip" => {
                    self.advance();
                    Ok(Expr::Control(ControlNode {
                        kind: ControlKind::Skip,
                        hint: None,
                        location: loc,
                    }))
                }
                "done" => {
                    self.advance();
                    Ok(Expr::Control(ControlNode {
                        kind: ControlKind::Done,
                        hint: None,
                        location: loc,
                    }))
                }
                lang if is_known_language(lang) => Ok(Expr::Run(self.parse_run_node()?)),
                other => Err(MlldError::parse_expecting(
                    format!("unexpected '{other}' in expression"),
                    vec!["@variable".to_string(), "literal".to_string()],
                    loc,
                )),
            },
            other => Err(MlldError::parse_expecting(
                format!("unexpected {} in expression", other.describe()),
                vec!["expression".to_string()],
                loc,
            )),
        }
    }

    /// `@name...`: variable reference or executable invocation; fields
    /// before the call select the callee (`@ns.fn(...)`)
    fn parse_at_expression(&mut self) -> Result<Expr, MlldError> {
        let loc = self.loc(&self.current);
        self.expect(&TokenKind::At)?;
        let identifier = self.expect_identifier("variable name")?;
        let callee_fields = self.parse_field_chain()?;

        if self.check(&TokenKind::LParen) {
            self.advance();
            let mut args = Vec::new();
            if !self.check(&TokenKind::RParen) {
                loop {
                    self.skip_newlines();
                    args.push(self.parse_expression()?);
                    self.skip_newlines();
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(&TokenKind::RParen)?;
            let fields = self.parse_field_chain()?;
            let with = if self.check_identifier("with") {
                Some(self.parse_with_clause()?)
            } else {
                None
            };
            return Ok(Expr::ExecInvocation(ExecInvocationNode {
                name: identifier,
                callee_fields,
                args,
                fields,
                pipes: Vec::new(),
                with,
                location: loc,
            }));
        }

        Ok(Expr::VarRef(VarRefNode {
            identifier,
            fields: callee_fields,
            pipes: Vec::new(),
            location: loc,
        }))
    }

    fn parse_field_chain(&mut self) -> Result<Vec<FieldAccess>, MlldError> {
        let mut fields = Vec::new();
        loop {
            if self.check(&TokenKind::Dot) {
                // Only consume when a field follows; a bare trailing dot
                // belongs to surrounding text
                match self.peek_after_dot() {
                    Some(FieldAfterDot::Name) => {
                        self.advance();
                        let name = self.expect_identifier("field name")?;
                        fields.push(FieldAccess::Field(name));
                    }
                    Some(FieldAfterDot::Number) => {
                        self.advance();
                        let TokenKind::Number(n) = self.current.kind else {
                            return Err(self.unexpected("numeric field"));
                        };
                        self.advance();
                        fields.push(FieldAccess::Index(n as i64));
                    }
                    None => break,
                }
            } else if self.check(&TokenKind::LBracket) {
                self.advance();
                let negative = self.match_token(&TokenKind::Minus);
                match &self.current.kind.clone() {
                    TokenKind::Number(n) => {
                        self.advance();
                        let idx = *n as i64;
                        fields.push(FieldAccess::Index(if negative { -idx } else { idx }));
                    }
                    TokenKind::String(s) | TokenKind::DoubleString(s) if !negative => {
                        self.advance();
                        fields.push(FieldAccess::StringKey(s.clone()));
                    }
                    other => {
                        return Err(MlldError::parse_expecting(
                            format!("unexpected {} in bracket access", other.describe()),
                            vec!["number".to_string(), "string".to_string()],
                            self.loc(&self.current),
                        ))
                    }
                }
                self.expect(&TokenKind::RBracket)?;
            } else {
                break;
            }
        }
        Ok(fields)
    }

    fn peek_after_dot(&mut self) -> Option<FieldAfterDot> {
        // The lexer has already consumed through `current`; look at raw text
        let dot_end = self.current.end;
        let next = self.source.get(dot_end..)?.chars().next()?;
        if is_id_start(next) {
            Some(FieldAfterDot::Name)
        } else if next.is_ascii_digit() {
            Some(FieldAfterDot::Number)
        } else {
            None
        }
    }

    fn parse_object_literal(&mut self) -> Result<Expr, MlldError> {
        let loc = self.loc(&self.current);
        self.expect(&TokenKind::LBrace)?;
        let mut entries = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            let key = match &self.current.kind.clone() {
                TokenKind::Identifier(name) => {
                    self.advance();
                    name.clone()
                }
                TokenKind::String(s) | TokenKind::DoubleString(s) => {
                    self.advance();
                    s.clone()
                }
                other => {
                    return Err(MlldError::parse_expecting(
                        format!("unexpected {} as object key", other.describe()),
                        vec!["identifier".to_string(), "string".to_string()],
                        self.loc(&self.current),
                    ))
                }
            };
            self.expect(&TokenKind::Colon)?;
            self.skip_newlines();
            let value = self.parse_expression()?;
            entries.push((key, value));
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(Expr::Object(ObjectNode {
            entries,
            location: loc,
        }))
    }

    fn parse_array_literal(&mut self) -> Result<Expr, MlldError> {
        let loc = self.loc(&self.current);
        self.expect(&TokenKind::LBracket)?;
        let mut elements = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBracket) {
            elements.push(self.parse_expression()?);
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBracket)?;
        Ok(Expr::Array(ArrayNode {
            elements,
            location: loc,
        }))
    }

    /// `when` has been consumed; parse `[first|any|all] [ arms ]`
    fn parse_when_expr_tail(&mut self, loc: SourceLocation) -> Result<WhenExprNode, MlldError> {
        let modifier = self.parse_when_modifier();
        self.expect(&TokenKind::LBracket)?;
        let mut arms = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBracket) {
            let condition = self.parse_when_condition()?;
            self.expect(&TokenKind::Arrow)?;
            let action = self.parse_expression()?;
            arms.push(WhenArm { condition, action });
            self.skip_arm_separators();
        }
        self.expect(&TokenKind::RBracket)?;
        Ok(WhenExprNode {
            modifier,
            arms,
            location: loc,
        })
    }

    fn parse_when_modifier(&mut self) -> Option<WhenModifier> {
        let modifier = match &self.current.kind {
            TokenKind::Identifier(word) => match word.as_str() {
                "first" => Some(WhenModifier::First),
                "any" => Some(WhenModifier::Any),
                "all" => Some(WhenModifier::All),
                _ => None,
            },
            _ => None,
        };
        if modifier.is_some() {
            self.advance();
        }
        modifier
    }

    fn parse_when_condition(&mut self) -> Result<WhenCondition, MlldError> {
        if self.check(&TokenKind::Star) {
            self.advance();
            return Ok(WhenCondition::Wildcard);
        }
        if self.check_identifier("none") {
            self.advance();
            return Ok(WhenCondition::None);
        }
        Ok(WhenCondition::Expr(self.parse_expression()?))
    }

    fn parse_for_expr(&mut self, loc: SourceLocation) -> Result<Expr, MlldError> {
        let parallel = self.parse_parallel_clause()?;
        self.expect(&TokenKind::At)?;
        let binding = self.expect_identifier("loop binding")?;
        self.expect_keyword("in")?;
        let iterable = self.parse_expression()?;
        self.expect(&TokenKind::Arrow)?;
        let body = self.parse_expression()?;
        Ok(Expr::For(ForExprNode {
            binding,
            iterable: Box::new(iterable),
            body: Box::new(body),
            parallel,
            location: loc,
        }))
    }

    fn parse_parallel_clause(&mut self) -> Result<Option<usize>, MlldError> {
        if !self.check_identifier("parallel") {
            return Ok(None);
        }
        self.advance();
        if !self.match_token(&TokenKind::LParen) {
            return Ok(Some(4));
        }
        let TokenKind::Number(n) = self.current.kind else {
            return Err(self.unexpected("parallelism degree"));
        };
        self.advance();
        self.expect(&TokenKind::RParen)?;
        if n < 1.0 {
            return Err(MlldError::parse(
                "parallelism degree must be at least 1",
                self.loc(&self.previous),
            ));
        }
        Ok(Some(n as usize))
    }

    fn parse_alligator(&mut self) -> Result<Expr, MlldError> {
        let lt = self.current.clone();
        let token = self.lexer.rescan_as_alligator(&lt);
        let TokenKind::Alligator(inner) = &token.kind else {
            return Err(MlldError::parse(
                "unterminated content reference",
                self.loc(&lt),
            ));
        };
        let location = self.loc(&lt);
        let mut node = parse_alligator_inner(inner, location)?;
        self.current = self.lexer.next_token();
        if self.check_identifier("as") {
            self.advance();
            match &self.current.kind.clone() {
                TokenKind::String(s) | TokenKind::DoubleString(s) => {
                    node.rename = Some(s.clone());
                    self.advance();
                }
                other => {
                    return Err(MlldError::parse_expecting(
                        format!("unexpected {} as rename pattern", other.describe()),
                        vec!["string".to_string()],
                        self.loc(&self.current),
                    ))
                }
            }
        }
        Ok(Expr::FileRef(node))
    }

    fn parse_run_node(&mut self) -> Result<RunNode, MlldError> {
        let loc = self.loc(&self.current);
        if self.check_identifier("run") {
            self.advance();
        }
        match &self.current.kind.clone() {
            TokenKind::String(text) => {
                self.advance();
                Ok(RunNode {
                    mode: RunMode::Command {
                        command: TemplateNode {
                            parts: vec![TemplatePart::Text(text.clone())],
                            location: loc.clone(),
                        },
                    },
                    location: loc,
                })
            }
            TokenKind::DoubleString(raw) | TokenKind::Template(raw) => {
                let tloc = self.loc(&self.current);
                self.advance();
                let command = self.parse_template_raw(raw, tloc)?;
                Ok(RunNode {
                    mode: RunMode::Command { command },
                    location: loc,
                })
            }
            TokenKind::Identifier(lang) if is_known_language(lang) => {
                let lang = lang.clone();
                self.advance();
                if !self.check(&TokenKind::LBrace) {
                    return Err(self.unexpected("code block"));
                }
                let brace = self.current.clone();
                let token = self.lexer.rescan_as_code_block(&brace);
                let TokenKind::CodeBlock(code) = &token.kind else {
                    return Err(MlldError::parse("unterminated code block", self.loc(&brace)));
                };
                let code = code.clone();
                self.current = self.lexer.next_token();
                Ok(RunNode {
                    mode: RunMode::Code { lang, code },
                    location: loc,
                })
            }
            other => Err(MlldError::parse_expecting(
                format!("unexpected {} in run", other.describe()),
                vec!["command string".to_string(), "language block".to_string()],
                self.loc(&self.current),
            )),
        }
    }

    fn parse_with_clause(&mut self) -> Result<WithClause, MlldError> {
        self.expect_keyword("with")?;
        self.expect(&TokenKind::LBrace)?;
        let mut clause = WithClause::default();
        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            let key = self.expect_identifier("with-clause key")?;
            self.expect(&TokenKind::Colon)?;
            self.skip_newlines();
            match key.as_str() {
                "pipeline" => {
                    self.expect(&TokenKind::LBracket)?;
                    self.skip_newlines();
                    while !self.check(&TokenKind::RBracket) {
                        clause.pipeline.push(self.parse_stage()?);
                        self.skip_newlines();
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    self.expect(&TokenKind::RBracket)?;
                }
                "format" => match &self.current.kind.clone() {
                    TokenKind::String(s) | TokenKind::DoubleString(s) => {
                        clause.format = Some(s.clone());
                        self.advance();
                    }
                    TokenKind::Identifier(s) => {
                        clause.format = Some(s.clone());
                        self.advance();
                    }
                    _ => return Err(self.unexpected("format name")),
                },
                "timeout" => {
                    let TokenKind::Number(n) = self.current.kind else {
                        return Err(self.unexpected("timeout in milliseconds"));
                    };
                    clause.timeout_ms = Some(n as u64);
                    self.advance();
                }
                other => {
                    return Err(MlldError::parse_expecting(
                        format!("unknown with-clause key '{other}'"),
                        vec![
                            "pipeline".to_string(),
                            "format".to_string(),
                            "timeout".to_string(),
                        ],
                        self.loc(&self.previous),
                    ))
                }
            }
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(clause)
    }

    // ============ TEMPLATE INTERPOLATION ============

    /// Scan a raw template body for `@var.field` and `@fn(args)` holes
    pub fn parse_template_raw(
        &self,
        raw: &str,
        location: SourceLocation,
    ) -> Result<TemplateNode, MlldError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut chars = raw.char_indices().peekable();
        while let Some((_, ch)) = chars.next() {
            if ch == '\\' {
                if let Some((_, next)) = chars.peek().copied() {
                    if next == '@' {
                        chars.next();
                        text.push('@');
                        continue;
                    }
                }
                text.push(ch);
                continue;
            }
            if ch != '@' {
                text.push(ch);
                continue;
            }
            let Some((_, first)) = chars.peek().copied() else {
                text.push('@');
                continue;
            };
            if !is_id_start(first) {
                text.push('@');
                continue;
            }
            // Flush text and read the reference
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            let mut identifier = String::new();
            while let Some((_, c)) = chars.peek().copied() {
                if is_id_continue(c) {
                    identifier.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            // Exec hole: @fn(args)
            if chars.peek().map(|&(_, c)| c) == Some('(') {
                chars.next();
                let mut depth = 1usize;
                let mut args_text = String::new();
                for (_, c) in chars.by_ref() {
                    match c {
                        '(' => {
                            depth += 1;
                            args_text.push(c);
                        }
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            args_text.push(c);
                        }
                        _ => args_text.push(c),
                    }
                }
                let args = parse_expression_list(&args_text, location.clone())?;
                parts.push(TemplatePart::Exec(ExecInvocationNode {
                    name: identifier,
                    callee_fields: Vec::new(),
                    args,
                    fields: Vec::new(),
                    pipes: Vec::new(),
                    with: None,
                    location: location.clone(),
                }));
                continue;
            }
            // Field chain: .name, .0, [2], [-1], ["key"]
            let mut fields = Vec::new();
            loop {
                match chars.peek().copied() {
                    Some((_, '.')) => {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        match lookahead.peek().copied() {
                            Some((_, c)) if is_id_start(c) => {
                                chars.next();
                                let mut name = String::new();
                                while let Some((_, c)) = chars.peek().copied() {
                                    if is_id_continue(c) {
                                        name.push(c);
                                        chars.next();
                                    } else {
                                        break;
                                    }
                                }
                                fields.push(FieldAccess::Field(name));
                            }
                            Some((_, c)) if c.is_ascii_digit() => {
                                chars.next();
                                let mut digits = String::new();
                                while let Some((_, c)) = chars.peek().copied() {
                                    if c.is_ascii_digit() {
                                        digits.push(c);
                                        chars.next();
                                    } else {
                                        break;
                                    }
                                }
                                if let Ok(idx) = digits.parse::<i64>() {
                                    fields.push(FieldAccess::Index(idx));
                                }
                            }
                            _ => break,
                        }
                    }
                    Some((_, '[')) => {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        let mut inner = String::new();
                        let mut ok = false;
                        for (_, c) in lookahead.by_ref() {
                            if c == ']' {
                                ok = true;
                                break;
                            }
                            inner.push(c);
                        }
                        if !ok {
                            break;
                        }
                        let trimmed = inner.trim();
                        if let Ok(idx) = trimmed.parse::<i64>() {
                            fields.push(FieldAccess::Index(idx));
                        } else if let Some(key) = trimmed
                            .strip_prefix('"')
                            .and_then(|t| t.strip_suffix('"'))
                            .or_else(|| {
                                trimmed.strip_prefix('\'').and_then(|t| t.strip_suffix('\''))
                            })
                        {
                            fields.push(FieldAccess::StringKey(key.to_string()));
                        } else {
                            break;
                        }
                        chars = lookahead;
                    }
                    _ => break,
                }
            }
            parts.push(TemplatePart::Var(VarRefNode {
                identifier,
                fields,
                pipes: Vec::new(),
                location: location.clone(),
            }));
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        if parts.is_empty() {
            parts.push(TemplatePart::Text(String::new()));
        }
        Ok(TemplateNode { parts, location })
    }

    // ============ TOKEN HELPERS ============

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, self.lexer.next_token());
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn check_identifier(&self, word: &str) -> bool {
        matches!(&self.current.kind, TokenKind::Identifier(name) if name == word)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), MlldError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(MlldError::parse_expecting(
                format!("unexpected {}", self.current.kind.describe()),
                vec![kind.describe()],
                self.loc(&self.current),
            ))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, MlldError> {
        match &self.current.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(MlldError::parse_expecting(
                format!("unexpected {}, expected {what}", other.describe()),
                vec![what.to_string()],
                self.loc(&self.current),
            )),
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), MlldError> {
        if self.check_identifier(word) {
            self.advance();
            Ok(())
        } else {
            Err(MlldError::parse_expecting(
                format!("unexpected {}", self.current.kind.describe()),
                vec![format!("'{word}'")],
                self.loc(&self.current),
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_arm_separators(&mut self) {
        loop {
            if self.check(&TokenKind::Newline) || self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn unexpected(&self, expected: &str) -> MlldError {
        MlldError::parse_expecting(
            format!("unexpected {}", self.current.kind.describe()),
            vec![expected.to_string()],
            self.loc(&self.current),
        )
    }

    fn loc(&self, token: &Token) -> SourceLocation {
        let loc = token.location.clone();
        match self.file {
            Some(f) if loc.file.is_none() => loc.in_file(f),
            _ => loc,
        }
    }
}

enum FieldAfterDot {
    Name,
    Number,
}

/// Collapse an interpolation-free template to a plain string literal
fn collapse_template(template: TemplateNode) -> Expr {
    let only_text = template
        .parts
        .iter()
        .all(|p| matches!(p, TemplatePart::Text(_)));
    if only_text {
        let text: String = template
            .parts
            .iter()
            .map(|p| match p {
                TemplatePart::Text(t) => t.as_str(),
                _ => "",
            })
            .collect();
        return Expr::Literal(LiteralNode {
            value: LiteralValue::String(text),
            location: template.location,
        });
    }
    Expr::Template(template)
}

/// Parse a standalone comma-separated expression list (template exec holes)
fn parse_expression_list(source: &str, location: SourceLocation) -> Result<Vec<Expr>, MlldError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut parser = DirectiveParser::new(source, 0, location.line, location.column, None);
    let mut args = Vec::new();
    loop {
        args.push(parser.parse_expression()?);
        if !parser.match_token(&TokenKind::Comma) {
            break;
        }
    }
    Ok(args)
}

/// Parse the inside of `<...>`: path, optional `# section`, optional
/// `{ selectors }`
fn parse_alligator_inner(
    inner: &str,
    location: SourceLocation,
) -> Result<FileRefNode, MlldError> {
    let mut rest = inner.trim();
    let mut selectors = Vec::new();

    if let Some((before, after_open)) = rest.split_once('{') {
        let Some((block, _)) = after_open.rsplit_once('}') else {
            return Err(MlldError::parse(
                "unterminated selector group in content reference",
                location,
            ));
        };
        for entry in block.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(name) = entry.strip_prefix('(').and_then(|e| e.strip_suffix(')')) {
                selectors.push(AstSelector {
                    name: name.trim().to_string(),
                    usage: true,
                });
            } else {
                selectors.push(AstSelector {
                    name: entry.to_string(),
                    usage: false,
                });
            }
        }
        rest = before.trim_end();
    }

    let (source, section) = match rest.split_once(" # ") {
        Some((path, section)) => (path.trim(), Some(section.trim().to_string())),
        None => (rest, None),
    };

    if source.is_empty() {
        return Err(MlldError::parse("empty content reference", location));
    }

    Ok(FileRefNode {
        source: source.to_string(),
        section,
        selectors,
        fields: Vec::new(),
        pipes: Vec::new(),
        rename: None,
        location,
    })
}

fn is_known_language(word: &str) -> bool {
    matches!(word, "sh" | "bash" | "js" | "node" | "python" | "py")
}

fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
    let op = match kind {
        TokenKind::PipePipe => (BinaryOp::Or, 1),
        TokenKind::AmpAmp => (BinaryOp::And, 2),
        TokenKind::EqEq => (BinaryOp::Eq, 3),
        TokenKind::NotEq => (BinaryOp::NotEq, 3),
        TokenKind::Lt => (BinaryOp::Lt, 4),
        TokenKind::LtEq => (BinaryOp::LtEq, 4),
        TokenKind::Gt => (BinaryOp::Gt, 4),
        TokenKind::GtEq => (BinaryOp::GtEq, 4),
        TokenKind::Plus => (BinaryOp::Add, 5),
        TokenKind::Minus => (BinaryOp::Sub, 5),
        TokenKind::Star => (BinaryOp::Mul, 6),
        TokenKind::Slash => (BinaryOp::Div, 6),
        TokenKind::Percent => (BinaryOp::Mod, 6),
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_directive(source: &str) -> DirectiveNode {
        let doc = parse_document(source).expect("parse");
        for node in doc.nodes {
            if let Node::Directive(d) = node {
                return d;
            }
        }
        panic!("no directive in {source:?}");
    }

    #[test]
    fn plain_text_passes_through() {
        let doc = parse_document("# Title\n\nBody text\n").expect("parse");
        assert_eq!(doc.nodes.len(), 3);
        assert!(matches!(&doc.nodes[0], Node::Text(t) if t.content == "# Title"));
        assert!(matches!(&doc.nodes[1], Node::Newline(_)));
        assert!(matches!(&doc.nodes[2], Node::Text(t) if t.content == "Body text"));
    }

    #[test]
    fn var_with_object_literal() {
        let directive = single_directive(r#"/var @user = {"name":"Alice","age":30}"#);
        let DirectiveKind::Var(var) = directive.kind else {
            panic!("expected /var");
        };
        assert_eq!(var.name, "user");
        let Expr::Object(obj) = var.value else {
            panic!("expected object literal");
        };
        assert_eq!(obj.entries.len(), 2);
        assert_eq!(obj.entries[0].0, "name");
    }

    #[test]
    fn show_template_interpolation() {
        let directive = single_directive("/show `name=@user.name age=@user.age`");
        let DirectiveKind::Show(show) = directive.kind else {
            panic!("expected /show");
        };
        let Expr::Template(template) = show.value else {
            panic!("expected template");
        };
        assert_eq!(template.parts.len(), 4);
        match &template.parts[1] {
            TemplatePart::Var(var) => {
                assert_eq!(var.identifier, "user");
                assert_eq!(var.fields, vec![FieldAccess::Field("name".into())]);
            }
            other => panic!("expected interpolation, got {other:?}"),
        }
    }

    #[test]
    fn pipeline_chain_with_inline_effect() {
        let directive =
            single_directive(r#"/var @r = @src() | show "attempt @p.try" | @check(@p)"#);
        let DirectiveKind::Var(var) = directive.kind else {
            panic!("expected /var");
        };
        let Expr::Piped(piped) = var.value else {
            panic!("expected pipeline");
        };
        assert!(matches!(*piped.head, Expr::ExecInvocation(_)));
        assert_eq!(piped.stages.len(), 2);
        assert!(piped.stages[0].is_effect());
        assert!(!piped.stages[1].is_effect());
    }

    #[test]
    fn alligator_with_rename() {
        let directive =
            single_directive(r####"/var @m = <docs/*.md> as "### <>.fm.name (<>.relative)""####);
        let DirectiveKind::Var(var) = directive.kind else {
            panic!("expected /var");
        };
        let Expr::FileRef(file) = var.value else {
            panic!("expected content reference");
        };
        assert_eq!(file.source, "docs/*.md");
        assert!(file.has_glob());
        assert_eq!(file.rename.as_deref(), Some("### <>.fm.name (<>.relative)"));
    }

    #[test]
    fn alligator_with_section_and_selectors() {
        let directive = single_directive("/var @api = <src/lib.ts { connect, (close) }>");
        let DirectiveKind::Var(var) = directive.kind else {
            panic!("expected /var");
        };
        let Expr::FileRef(file) = var.value else {
            panic!("expected content reference");
        };
        assert_eq!(file.source, "src/lib.ts");
        assert_eq!(
            file.selectors,
            vec![
                AstSelector {
                    name: "connect".into(),
                    usage: false
                },
                AstSelector {
                    name: "close".into(),
                    usage: true
                },
            ]
        );
    }

    #[test]
    fn exe_with_when_body() {
        let source = "/exe @check(input, pipeline) = when first [\n  @pipeline.try < 3 => retry \"again\"\n  * => \"done\"\n]";
        let directive = single_directive(source);
        let DirectiveKind::Exe(exe) = directive.kind else {
            panic!("expected /exe");
        };
        assert_eq!(exe.params.len(), 2);
        let ExeBody::When(when) = exe.body else {
            panic!("expected when body");
        };
        assert_eq!(when.modifier, Some(WhenModifier::First));
        assert_eq!(when.arms.len(), 2);
        assert!(matches!(when.arms[1].condition, WhenCondition::Wildcard));
        let Expr::Control(retry) = &when.arms[0].action else {
            panic!("expected retry action");
        };
        assert_eq!(retry.kind, ControlKind::Retry);
        assert!(retry.hint.is_some());
    }

    #[test]
    fn import_selected_bindings() {
        let directive = single_directive(r#"/import { x, y as z } from "./b.mld""#);
        let DirectiveKind::Import(import) = directive.kind else {
            panic!("expected /import");
        };
        assert_eq!(import.source, "./b.mld");
        let ImportSelection::Selected(bindings) = import.selection else {
            panic!("expected selected import");
        };
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].alias.as_deref(), Some("z"));
    }

    #[test]
    fn exe_js_code_body() {
        let directive = single_directive("/exe @src() = js { return \"payload\"; }");
        let DirectiveKind::Exe(exe) = directive.kind else {
            panic!("expected /exe");
        };
        let ExeBody::Run(run) = exe.body else {
            panic!("expected code body");
        };
        let RunMode::Code { lang, code } = run.mode else {
            panic!("expected code mode");
        };
        assert_eq!(lang, "js");
        assert!(code.contains("return \"payload\""));
    }

    #[test]
    fn code_fence_is_opaque() {
        let source = "```js\n/var @not_a_directive = 1\n```\n";
        let doc = parse_document(source).expect("parse");
        assert_eq!(doc.nodes.len(), 1);
        let Node::CodeFence(fence) = &doc.nodes[0] else {
            panic!("expected fence");
        };
        assert_eq!(fence.language.as_deref(), Some("js"));
        assert!(fence.content.contains("not_a_directive"));
    }

    #[test]
    fn frontmatter_block() {
        let source = "---\nname: demo\n---\nBody\n";
        let doc = parse_document(source).expect("parse");
        assert!(doc.frontmatter.is_some());
        assert!(doc.frontmatter.unwrap().raw.contains("name: demo"));
    }

    #[test]
    fn for_directive_with_parallel() {
        let directive = single_directive("/for parallel(2) @x in @items => show \"item @x\"");
        let DirectiveKind::For(for_) = directive.kind else {
            panic!("expected /for");
        };
        assert_eq!(for_.parallel, Some(2));
        assert_eq!(for_.binding, "x");
        assert!(matches!(for_.body, ActionNode::Directive(_)));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let err = parse_document("/var @x = 1 2\n").unwrap_err();
        assert!(err.to_string().contains("ParseError"));
    }

    #[test]
    fn output_to_env() {
        let directive = single_directive("/output @x to env RESULT");
        let DirectiveKind::Output(output) = directive.kind else {
            panic!("expected /output");
        };
        assert!(matches!(output.target, OutputTarget::Env(name) if name == "RESULT"));
    }
}
