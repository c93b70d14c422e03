//! Lexer for mlld directive text
//!
//! Converts the token-bearing parts of a document (everything after a `/`
//! directive marker) into a stream of tokens. Document-level scanning — the
//! split into plain text, fences, and directives — happens in the parser;
//! the lexer only ever starts at a directive and stops when the parser has
//! consumed a complete one.
//!
//! Two constructs cannot be tokenized context-free and are handled by
//! parser-driven rescans, the same way a `/` is rescanned as a regexp in
//! grammars that need it: `<...>` alligator references (`rescan_as_alligator`)
//! and `{ ... }` host-language code blocks (`rescan_as_code_block`).

use std::iter::Peekable;
use std::str::CharIndices;

use crate::error::SourceLocation;

/// Token types for mlld directive text
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    /// Single-quoted: literal, no interpolation
    String(String),
    /// Double-quoted: raw content, interpolated by the parser
    DoubleString(String),
    /// Backtick template: raw content, interpolated by the parser
    Template(String),
    /// Balanced `{ ... }` host-language block (rescan only)
    CodeBlock(String),
    /// `<...>` content reference, inner text (rescan only)
    Alligator(String),
    True,
    False,
    Null,

    /// Identifiers; mlld keywords are contextual and matched by the parser
    Identifier(String),

    // Punctuation
    At,       // @
    Slash,    // / (directive marker position only; division elsewhere)
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Comma,    // ,
    Colon,    // :
    Dot,      // .
    Hash,     // #
    Arrow,    // =>
    Assign,   // =

    // Operators
    EqEq,     // ==
    NotEq,    // !=
    Lt,       // <
    LtEq,     // <=
    Gt,       // >
    GtEq,     // >=
    AmpAmp,   // &&
    PipePipe, // ||
    Pipe,     // |
    Bang,     // !
    Question, // ?
    Plus,     // +
    Minus,    // -
    Star,     // *
    Percent,  // %

    // Special
    Newline,
    Eof,
    Invalid(char),
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Number(_) => "number".to_string(),
            TokenKind::String(_) | TokenKind::DoubleString(_) => "string".to_string(),
            TokenKind::Template(_) => "template".to_string(),
            TokenKind::CodeBlock(_) => "code block".to_string(),
            TokenKind::Alligator(_) => "content reference".to_string(),
            TokenKind::Identifier(name) => format!("'{name}'"),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Invalid(c) => format!("'{c}'"),
            other => format!("{other:?}"),
        }
    }
}

/// A token with its source location and end offset
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: SourceLocation,
    pub end: usize,
}

impl Token {
    pub fn new(kind: TokenKind, location: SourceLocation, end: usize) -> Self {
        Self {
            kind,
            location,
            end,
        }
    }

    pub fn eof(offset: usize, line: u32, column: u32) -> Self {
        Self {
            kind: TokenKind::Eof,
            location: SourceLocation::new(line, column, offset),
            end: offset,
        }
    }
}

/// Lexer over directive text within a document
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    /// Base offset added to char_indices positions; the lexer usually starts
    /// mid-document
    base_offset: usize,
    current_pos: usize,
    line: u32,
    column: u32,
    start_pos: usize,
    start_line: u32,
    start_column: u32,
}

impl<'a> Lexer<'a> {
    /// Start lexing at `offset` into `source`, which sits at `line`/`column`
    pub fn at(source: &'a str, offset: usize, line: u32, column: u32) -> Self {
        Self {
            source,
            chars: source.get(offset..).unwrap_or("").char_indices().peekable(),
            base_offset: offset,
            current_pos: offset,
            line,
            column,
            start_pos: offset,
            start_line: line,
            start_column: column,
        }
    }

    /// Byte offset of the next unread character
    pub fn position(&self) -> usize {
        self.current_pos
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Token {
        self.skip_inline_whitespace();

        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;

        let Some((_, ch)) = self.advance() else {
            return Token::eof(self.current_pos, self.line, self.column);
        };

        let kind = match ch {
            '\n' => TokenKind::Newline,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '#' => TokenKind::Hash,
            '@' => TokenKind::At,
            '/' => TokenKind::Slash,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '%' => TokenKind::Percent,
            '?' => TokenKind::Question,
            '=' => {
                if self.match_char('>') {
                    TokenKind::Arrow
                } else if self.match_char('=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.match_char('=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.match_char('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.match_char('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.match_char('&') {
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Invalid('&')
                }
            }
            '|' => {
                if self.match_char('|') {
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            '\'' => self.scan_string('\''),
            '"' => self.scan_string('"'),
            '`' => self.scan_template(),
            '0'..='9' => self.scan_number(ch),
            c if is_id_start(c) => self.scan_identifier(c),
            c => TokenKind::Invalid(c),
        };

        Token::new(kind, self.start_location(), self.current_pos)
    }

    /// Rescan from a `<` token as an alligator reference. Consumes through
    /// the matching `>`, respecting `{ ... }` selector groups and quoted
    /// rename patterns, and returns the inner text.
    pub fn rescan_as_alligator(&mut self, from: &Token) -> Token {
        self.reset_to(from);
        // consume '<'
        self.advance();
        let inner_start = self.current_pos;
        let mut depth = 0usize;
        let mut inner_end = self.current_pos;
        loop {
            match self.peek() {
                None | Some('\n') => break,
                Some('{') => {
                    depth += 1;
                    self.advance();
                }
                Some('}') => {
                    depth = depth.saturating_sub(1);
                    self.advance();
                }
                Some('>') if depth == 0 => {
                    inner_end = self.current_pos;
                    self.advance();
                    let inner = self
                        .source
                        .get(inner_start..inner_end)
                        .unwrap_or("")
                        .to_string();
                    return Token::new(
                        TokenKind::Alligator(inner),
                        from.location.clone(),
                        self.current_pos,
                    );
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        Token::new(TokenKind::Invalid('<'), from.location.clone(), inner_end)
    }

    /// Rescan from a `{` token as a balanced host-language code block.
    /// Braces inside string literals do not count toward the balance.
    pub fn rescan_as_code_block(&mut self, from: &Token) -> Token {
        self.reset_to(from);
        // consume '{'
        self.advance();
        let inner_start = self.current_pos;
        let mut depth = 1usize;
        let mut in_string: Option<char> = None;
        let mut escaped = false;
        while let Some((_, ch)) = self.advance() {
            if let Some(quote) = in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == quote {
                    in_string = None;
                }
                continue;
            }
            match ch {
                '"' | '\'' | '`' => in_string = Some(ch),
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner_end = self.current_pos - 1;
                        let inner = self
                            .source
                            .get(inner_start..inner_end)
                            .unwrap_or("")
                            .to_string();
                        return Token::new(
                            TokenKind::CodeBlock(inner),
                            from.location.clone(),
                            self.current_pos,
                        );
                    }
                }
                _ => {}
            }
        }
        Token::new(TokenKind::Invalid('{'), from.location.clone(), self.current_pos)
    }

    fn reset_to(&mut self, token: &Token) {
        let offset = token.location.offset;
        self.base_offset = offset;
        self.chars = self.source.get(offset..).unwrap_or("").char_indices().peekable();
        self.current_pos = offset;
        self.line = token.location.line;
        self.column = token.location.column;
    }

    fn start_location(&self) -> SourceLocation {
        SourceLocation::new(self.start_line, self.start_column, self.start_pos)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((pos, ch)) = result {
            self.current_pos = self.base_offset + pos + ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        result
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, ch)| *ch)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skip spaces, tabs, and `>> ...` comments; newlines are tokens
    fn skip_inline_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('>') if self.peek_second() == Some('>') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn peek_second(&self) -> Option<char> {
        let slice = self.source.get(self.current_pos..)?;
        let mut iter = slice.chars();
        iter.next();
        iter.next()
    }

    fn scan_string(&mut self, quote: char) -> TokenKind {
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return TokenKind::Invalid(quote),
                Some((_, ch)) if ch == quote => break,
                Some((_, '\\')) => match self.advance() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, c)) if c == quote => value.push(c),
                    // `\@` survives to the interpolation layer, which owns
                    // the unescaping of holes
                    Some((_, '@')) => {
                        if quote == '"' {
                            value.push('\\');
                        }
                        value.push('@');
                    }
                    Some((_, c)) => {
                        value.push('\\');
                        value.push(c);
                    }
                    None => return TokenKind::Invalid(quote),
                },
                Some((_, ch)) => value.push(ch),
            }
        }
        if quote == '\'' {
            TokenKind::String(value)
        } else {
            TokenKind::DoubleString(value)
        }
    }

    /// Backtick template; content is kept raw and interpolated by the parser
    fn scan_template(&mut self) -> TokenKind {
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return TokenKind::Invalid('`'),
                Some((_, '`')) => break,
                Some((_, '\\')) => match self.advance() {
                    Some((_, '`')) => value.push('`'),
                    Some((_, c)) => {
                        value.push('\\');
                        value.push(c);
                    }
                    None => return TokenKind::Invalid('`'),
                },
                Some((_, ch)) => value.push(ch),
            }
        }
        TokenKind::Template(value)
    }

    fn scan_number(&mut self, first: char) -> TokenKind {
        let mut text = String::new();
        text.push(first);
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // Fractional part only when a digit follows the dot, so field access
        // on numbers (`@arr.0.name`) stays unambiguous
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        match text.parse::<f64>() {
            Ok(n) => TokenKind::Number(n),
            Err(_) => TokenKind::Invalid(first),
        }
    }

    fn scan_identifier(&mut self, first: char) -> TokenKind {
        let mut name = String::new();
        name.push(first);
        while let Some(ch) = self.peek() {
            if is_id_continue(ch) {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        match name.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Identifier(name),
        }
    }
}

pub fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub fn is_id_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
