//! Alligator content loading
//!
//! `<file.ext>`, `<pattern/*.md # Section>`, `<file.ts { name, (usage) }>`,
//! `<https://...>`, optionally with an `as "pattern"` rename. Single files
//! load to one StructuredValue; globs load to an array of them (empty glob,
//! empty array); URL loads extract title/description and strip markup for
//! HTML; selector groups dispatch to the per-language definition scanner.

use std::path::Path;

use indexmap::IndexMap;

use crate::ast::{AstSelector, FileRefNode};
use crate::env::EnvRef;
use crate::error::{MlldError, SourceLocation};
use crate::pathops::{self, relative_to};
use crate::resolver::{domain_of, url_allowed};
use crate::structured::{ContentCategory, ContentContext, StructuredValue, estimate_tokens};
use crate::value::Value;

use super::Interpreter;

impl Interpreter {
    pub(crate) fn load_content(
        &mut self,
        file_ref: &FileRefNode,
        _env: &EnvRef,
    ) -> Result<Value, MlldError> {
        let location = &file_ref.location;

        if file_ref.is_url() {
            let mut wrapper = self.load_url(&file_ref.source)?;
            if let Some(pattern) = &file_ref.rename {
                apply_rename(&mut wrapper, pattern);
            }
            return Ok(wrapper.into_value());
        }

        if file_ref.has_glob() {
            let files = self.fs.glob(&self.current_dir.clone(), &file_ref.source)?;
            let mut items = Vec::with_capacity(files.len());
            for path in files {
                let mut wrapper = self.load_single(&path, file_ref, location)?;
                if let Some(pattern) = &file_ref.rename {
                    apply_rename(&mut wrapper, pattern);
                }
                items.push(wrapper.into_value());
            }
            return Ok(Value::array(items));
        }

        let ctx = self.path_context(true);
        let path = pathops::resolve_path(&file_ref.source, &ctx)?;
        if !file_ref.selectors.is_empty() {
            return self.load_definitions(&path, file_ref, location);
        }
        let mut wrapper = self.load_single(&path, file_ref, location)?;
        if let Some(pattern) = &file_ref.rename {
            apply_rename(&mut wrapper, pattern);
        }
        Ok(wrapper.into_value())
    }

    fn load_single(
        &mut self,
        path: &Path,
        file_ref: &FileRefNode,
        location: &SourceLocation,
    ) -> Result<StructuredValue, MlldError> {
        let raw = self.fs.read_to_string(path).map_err(|err| {
            MlldError::Directive {
                directive_kind: "load".to_string(),
                subtype: "content".to_string(),
                message: err.to_string(),
                location: Some(location.clone()),
            }
        })?;

        let (frontmatter, body) = split_frontmatter(&raw);
        let fm = match frontmatter {
            Some(yaml) => Some(parse_yaml_value(yaml, location)?),
            None => None,
        };

        let content = match &file_ref.section {
            Some(section) => extract_section(body, section).ok_or_else(|| MlldError::Directive {
                directive_kind: "load".to_string(),
                subtype: "section".to_string(),
                message: format!("section '{section}' not found in {}", path.display()),
                location: Some(location.clone()),
            })?,
            None => body.to_string(),
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let mut wrapper = match extension.as_str() {
            "json" => StructuredValue::from_json_text(&content).map_err(|err| {
                load_parse_error(path, &err, location)
            })?,
            "jsonl" => StructuredValue::from_jsonl_text(&content).map_err(|err| {
                load_parse_error(path, &err, location)
            })?,
            _ => StructuredValue::from_text(&content),
        };

        let category = ContentCategory::from_extension(&extension);
        let tokens = estimate_tokens(content.len(), category);
        wrapper.ctx = ContentContext {
            filename: path
                .file_name()
                .and_then(|f| f.to_str())
                .map(str::to_string),
            relative: Some(relative_to(path, &self.options.base_path)),
            absolute: Some(path.display().to_string()),
            fm,
            tokens: Some(tokens),
            tokest: Some(tokens),
            source: Some("file".to_string()),
            ..ContentContext::default()
        };
        Ok(wrapper)
    }

    fn load_url(&mut self, url: &str) -> Result<StructuredValue, MlldError> {
        if !self.options.allow_urls {
            return Err(MlldError::security(format!(
                "URL loads are disabled; cannot fetch {url}"
            )));
        }
        url_allowed(
            url,
            &self.options.url_allowed_domains,
            &self.options.url_blocked_domains,
        )?;
        let response = self
            .http
            .fetch(url, self.options.url_timeout_ms, self.options.url_max_size)?;
        let is_html = response
            .content_type()
            .is_some_and(|ct| ct.contains("text/html"));

        let mut wrapper = if is_html {
            let title = capture(&response.body, r"(?is)<title[^>]*>(.*?)</title>");
            let description = capture(
                &response.body,
                r#"(?is)<meta[^>]+name=["'](?:og:)?description["'][^>]+content=["']([^"']*)["']"#,
            )
            .or_else(|| {
                capture(
                    &response.body,
                    r#"(?is)<meta[^>]+content=["']([^"']*)["'][^>]+name=["'](?:og:)?description["']"#,
                )
            });
            let text = strip_html(&response.body);
            let mut wrapper = StructuredValue::from_text(text);
            wrapper.ctx.title = title;
            wrapper.ctx.description = description;
            wrapper.ctx.html = Some(response.body.clone());
            wrapper.kind = crate::structured::StructuredKind::Html;
            wrapper
        } else {
            StructuredValue::from_text(response.body.clone())
        };

        wrapper.ctx.url = Some(url.to_string());
        wrapper.ctx.domain = domain_of(url);
        wrapper.ctx.status = Some(response.status);
        wrapper.ctx.headers = Some(response.headers.clone());
        wrapper.ctx.source = Some("url".to_string());
        Ok(wrapper)
    }

    /// `{ name, (usage) }` selector loads: dispatch to the definition
    /// scanner for the file's language; unmatched selectors yield null,
    /// preserving request order
    fn load_definitions(
        &mut self,
        path: &Path,
        file_ref: &FileRefNode,
        location: &SourceLocation,
    ) -> Result<Value, MlldError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let Some(language) = language_for_extension(&extension) else {
            return Err(MlldError::Directive {
                directive_kind: "load".to_string(),
                subtype: "selector".to_string(),
                message: format!("no definition extractor for .{extension} files"),
                location: Some(location.clone()),
            });
        };
        let source = self.fs.read_to_string(path)?;
        let definitions = scan_definitions(language, &source);

        let mut results = Vec::with_capacity(file_ref.selectors.len());
        for selector in &file_ref.selectors {
            let matched = find_selected(&definitions, selector);
            match matched {
                Some(def) => {
                    let mut data = IndexMap::new();
                    data.insert("name".to_string(), Value::Text(def.name.clone()));
                    data.insert("type".to_string(), Value::Text(def.def_type.to_string()));
                    data.insert("span".to_string(), Value::Text(def.span.clone()));
                    let mut wrapper = StructuredValue::from_text(def.span.clone());
                    wrapper.data = Value::object(data);
                    wrapper.kind = crate::structured::StructuredKind::Object;
                    wrapper.ctx.filename = path
                        .file_name()
                        .and_then(|f| f.to_str())
                        .map(str::to_string);
                    wrapper.ctx.relative =
                        Some(relative_to(path, &self.options.base_path));
                    results.push(wrapper.into_value());
                }
                None => results.push(Value::Null),
            }
        }
        Ok(Value::array(results))
    }
}

fn load_parse_error(path: &Path, err: &MlldError, location: &SourceLocation) -> MlldError {
    MlldError::Directive {
        directive_kind: "load".to_string(),
        subtype: "parse".to_string(),
        message: format!("{}: {err}", path.display()),
        location: Some(location.clone()),
    }
}

/// Split a leading `---` YAML block from the body
pub(crate) fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (None, raw);
    };
    let mut consumed = 0usize;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = rest.get(..consumed).unwrap_or("");
            let body = rest.get(consumed + line.len()..).unwrap_or("");
            return (Some(yaml), body);
        }
        consumed += line.len();
    }
    (None, raw)
}

fn parse_yaml_value(yaml: &str, location: &SourceLocation) -> Result<Value, MlldError> {
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| MlldError::Directive {
            directive_kind: "load".to_string(),
            subtype: "frontmatter".to_string(),
            message: format!("invalid frontmatter: {e}"),
            location: Some(location.clone()),
        })?;
    let json = serde_json::to_value(&parsed).map_err(|e| MlldError::Directive {
        directive_kind: "load".to_string(),
        subtype: "frontmatter".to_string(),
        message: format!("invalid frontmatter: {e}"),
        location: Some(location.clone()),
    })?;
    Ok(Value::from_json(&json))
}

/// Extract a Markdown section by heading. Exact match first, then
/// case-insensitive. A heading of the form `##??` selects every section at
/// that level, joined by blank lines.
pub(crate) fn extract_section(body: &str, section: &str) -> Option<String> {
    if let Some(level) = section
        .strip_suffix("??")
        .filter(|prefix| !prefix.is_empty() && prefix.chars().all(|c| c == '#'))
        .map(str::len)
    {
        let sections = sections_at_level(body, level);
        if sections.is_empty() {
            return None;
        }
        return Some(sections.join("\n\n"));
    }

    find_section(body, section, true).or_else(|| find_section(body, section, false))
}

fn find_section(body: &str, section: &str, exact: bool) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some((level, title)) = heading_of(line) else {
            continue;
        };
        let hit = if exact {
            title == section
        } else {
            title.eq_ignore_ascii_case(section)
        };
        if !hit {
            continue;
        }
        let mut end = lines.len();
        for (j, candidate) in lines.iter().enumerate().skip(i + 1) {
            if let Some((candidate_level, _)) = heading_of(candidate) {
                if candidate_level <= level {
                    end = j;
                    break;
                }
            }
        }
        return Some(
            lines
                .get(i..end)
                .unwrap_or(&[])
                .join("\n")
                .trim_end()
                .to_string(),
        );
    }
    None
}

fn sections_at_level(body: &str, level: usize) -> Vec<String> {
    let lines: Vec<&str> = body.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(line) = lines.get(i) {
        match heading_of(line) {
            Some((l, _)) if l == level => {
                let mut end = lines.len();
                for (j, candidate) in lines.iter().enumerate().skip(i + 1) {
                    if let Some((candidate_level, _)) = heading_of(candidate) {
                        if candidate_level <= level {
                            end = j;
                            break;
                        }
                    }
                }
                out.push(
                    lines
                        .get(i..end)
                        .unwrap_or(&[])
                        .join("\n")
                        .trim_end()
                        .to_string(),
                );
                i = end;
            }
            _ => i += 1,
        }
    }
    out
}

fn heading_of(line: &str) -> Option<(usize, &str)> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = line.get(hashes..)?;
    let title = rest.strip_prefix(' ')?;
    Some((hashes, title.trim()))
}

/// The compiled `<>.key` placeholder pattern; compiled once, `None` only if
/// the fixed literal ever failed to build
fn rename_placeholder() -> Option<&'static regex::Regex> {
    static PATTERN: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"<>\.(fm\.[A-Za-z0-9_]+|[A-Za-z0-9_]+)").ok())
        .as_ref()
}

/// Interpolate an `as "pattern"` rename into an element. Placeholders:
/// `<>.fm.KEY`, `<>.relative`, `<>.filename`, `<>.absolute`, `<>.content`.
fn apply_rename(wrapper: &mut StructuredValue, pattern: &str) {
    let Some(re) = rename_placeholder() else {
        return;
    };
    let renamed = re
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if let Some(fm_key) = key.strip_prefix("fm.") {
                if let Some(Value::Object(map)) = &wrapper.ctx.fm {
                    if let Some(value) = map.get(fm_key) {
                        return value.display_string(false);
                    }
                }
                return String::new();
            }
            match key {
                "content" | "text" => wrapper.text.clone(),
                _ => wrapper
                    .ctx
                    .get(key)
                    .map(|v| v.display_string(false))
                    .unwrap_or_default(),
            }
        })
        .into_owned();
    wrapper.text = renamed.clone();
    wrapper.data = Value::Text(renamed);
}

fn capture(haystack: &str, pattern: &str) -> Option<String> {
    let re = regex::Regex::new(pattern).ok()?;
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Tag stripper for HTML text extraction: drops script/style blocks, strips
/// markup, collapses blank runs
fn strip_html(html: &str) -> String {
    let no_scripts = regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .map(|re| re.replace_all(html, " ").into_owned())
        .unwrap_or_else(|_| html.to_string());
    let no_tags = regex::Regex::new(r"(?s)<[^>]*>")
        .map(|re| re.replace_all(&no_scripts, " ").into_owned())
        .unwrap_or(no_scripts);
    let decoded = no_tags
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let mut out = String::new();
    for line in decoded.lines() {
        let trimmed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !trimmed.is_empty() {
            out.push_str(&trimmed);
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

// ============ DEFINITION SCANNER ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Language {
    TypeScript,
    Python,
    Ruby,
    Go,
    Rust,
    Java,
    Solidity,
    Cpp,
    CSharp,
}

pub(crate) fn language_for_extension(extension: &str) -> Option<Language> {
    match extension {
        "ts" | "tsx" | "js" | "jsx" | "mjs" => Some(Language::TypeScript),
        "py" | "pyi" => Some(Language::Python),
        "rb" => Some(Language::Ruby),
        "go" => Some(Language::Go),
        "rs" => Some(Language::Rust),
        "java" => Some(Language::Java),
        "sol" => Some(Language::Solidity),
        "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" => Some(Language::Cpp),
        "cs" => Some(Language::CSharp),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Definition {
    pub name: String,
    pub def_type: &'static str,
    pub span: String,
}

/// Line-oriented definition scan. A definition's span runs from its first
/// line to the next definition at the same or lower indentation.
pub(crate) fn scan_definitions(language: Language, source: &str) -> Vec<Definition> {
    let lines: Vec<&str> = source.lines().collect();
    let mut starts: Vec<(usize, usize, String, &'static str)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some((name, def_type)) = definition_on_line(language, line) {
            let indent = line.len() - line.trim_start().len();
            starts.push((i, indent, name, def_type));
        }
    }
    let mut out = Vec::with_capacity(starts.len());
    for (idx, (start, indent, name, def_type)) in starts.iter().enumerate() {
        let mut end = lines.len();
        for (next_start, next_indent, _, _) in starts.iter().skip(idx + 1) {
            if next_indent <= indent {
                end = *next_start;
                break;
            }
        }
        out.push(Definition {
            name: name.clone(),
            def_type,
            span: lines
                .get(*start..end)
                .unwrap_or(&[])
                .join("\n")
                .trim_end()
                .to_string(),
        });
    }
    out
}

fn definition_on_line(language: Language, line: &str) -> Option<(String, &'static str)> {
    let trimmed = line.trim_start();
    let keywords: &[(&str, &'static str)] = match language {
        Language::TypeScript => &[
            ("function ", "function"),
            ("class ", "class"),
            ("interface ", "interface"),
            ("type ", "type"),
            ("enum ", "enum"),
            ("const ", "const"),
            ("let ", "variable"),
        ],
        Language::Python => &[("def ", "function"), ("class ", "class")],
        Language::Ruby => &[("def ", "method"), ("class ", "class"), ("module ", "module")],
        Language::Go => &[("func ", "function"), ("type ", "type")],
        Language::Rust => &[
            ("fn ", "function"),
            ("struct ", "struct"),
            ("enum ", "enum"),
            ("trait ", "trait"),
            ("mod ", "module"),
            ("const ", "const"),
        ],
        Language::Java | Language::CSharp => &[
            ("class ", "class"),
            ("interface ", "interface"),
            ("enum ", "enum"),
        ],
        Language::Solidity => &[
            ("contract ", "contract"),
            ("function ", "function"),
            ("event ", "event"),
        ],
        Language::Cpp => &[
            ("class ", "class"),
            ("struct ", "struct"),
            ("namespace ", "namespace"),
        ],
    };

    let without_modifiers = strip_modifiers(language, trimmed);
    for (keyword, def_type) in keywords {
        if let Some(rest) = without_modifiers.strip_prefix(keyword) {
            let name: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some((name, def_type));
            }
        }
    }
    None
}

fn strip_modifiers(language: Language, line: &str) -> &str {
    let modifiers: &[&str] = match language {
        Language::TypeScript => &["export ", "default ", "async ", "declare ", "abstract "],
        Language::Python => &["async "],
        Language::Rust => &["pub(crate) ", "pub ", "async ", "unsafe "],
        Language::Go => &[],
        Language::Java | Language::CSharp => &[
            "public ", "private ", "protected ", "static ", "final ", "abstract ", "sealed ",
        ],
        Language::Solidity => &[],
        Language::Ruby => &[],
        Language::Cpp => &["template ", "typename "],
    };
    let mut rest = line;
    let mut changed = true;
    while changed {
        changed = false;
        for modifier in modifiers {
            if let Some(stripped) = rest.strip_prefix(modifier) {
                rest = stripped;
                changed = true;
            }
        }
    }
    rest
}

/// Resolve one selector: by definition name, or — for `(usage)` markers —
/// definitions whose span references the name without defining it
fn find_selected<'a>(
    definitions: &'a [Definition],
    selector: &AstSelector,
) -> Option<&'a Definition> {
    if !selector.usage {
        return definitions.iter().find(|d| d.name == selector.name);
    }
    let word = regex::Regex::new(&format!(r"\b{}\b", regex::escape(&selector.name))).ok()?;
    definitions
        .iter()
        .find(|d| d.name != selector.name && word.is_match(&d.span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_split() {
        let (fm, body) = split_frontmatter("---\nname: A\n---\n# Title\n");
        assert_eq!(fm, Some("name: A\n"));
        assert_eq!(body, "# Title\n");
        let (none, all) = split_frontmatter("no frontmatter");
        assert!(none.is_none());
        assert_eq!(all, "no frontmatter");
    }

    #[test]
    fn section_extraction_is_case_insensitive_fallback() {
        let body = "# Top\n\n## Usage\nuse it\n\n## Other\nnope\n";
        assert_eq!(
            extract_section(body, "Usage").unwrap(),
            "## Usage\nuse it"
        );
        assert_eq!(
            extract_section(body, "usage").unwrap(),
            "## Usage\nuse it"
        );
        assert!(extract_section(body, "Missing").is_none());
    }

    #[test]
    fn all_h2_selector() {
        let body = "# Top\n## A\na\n## B\nb\n";
        assert_eq!(extract_section(body, "##??").unwrap(), "## A\na\n\n## B\nb");
    }

    #[test]
    fn rust_definitions_scanned_with_spans() {
        let source = "pub fn connect() {\n    open()\n}\n\npub struct Pool {\n    size: usize,\n}\n";
        let defs = scan_definitions(Language::Rust, source);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "connect");
        assert_eq!(defs[0].def_type, "function");
        assert!(defs[0].span.contains("open()"));
        assert_eq!(defs[1].name, "Pool");
    }

    #[test]
    fn usage_selector_finds_referencing_definition() {
        let source = "function close() {}\nfunction shutdown() {\n  close();\n}\n";
        let defs = scan_definitions(Language::TypeScript, source);
        let usage = find_selected(
            &defs,
            &AstSelector {
                name: "close".into(),
                usage: true,
            },
        )
        .unwrap();
        assert_eq!(usage.name, "shutdown");
    }

    #[test]
    fn html_stripping_keeps_text() {
        let html = "<html><head><title>Docs</title><style>.a{}</style></head><body><h1>Hi</h1><p>Body &amp; soul</p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Hi"));
        assert!(text.contains("Body & soul"));
        assert!(!text.contains(".a{}"));
    }
}
