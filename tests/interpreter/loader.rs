//! Alligator content loading: files, globs, sections, selectors, URLs

use pretty_assertions::assert_eq;

use mlld::platform::ScriptedHttpClient;

use super::Harness;

#[test]
fn single_file_load_shows_content() {
    let harness = Harness::new().file("/docs/note.md", "remember the milk\n");
    assert_eq!(
        harness.eval("/var @note = <docs/note.md>\n/show @note\n"),
        "remember the milk\n"
    );
}

#[test]
fn content_metadata_is_reachable_by_field() {
    let harness = Harness::new().file("/docs/note.md", "text\n");
    let source = "/var @note = <docs/note.md>\n/show @note.filename\n/show @note.relative\n";
    assert_eq!(harness.eval(source), "note.md\ndocs/note.md\n");
}

#[test]
fn frontmatter_is_parsed_and_stripped_from_content() {
    let harness = Harness::new().file("/docs/a.md", "---\nname: A\ntags: [x, y]\n---\n# A\n");
    let source = "/var @doc = <docs/a.md>\n/show @doc.fm.name\n/show @doc\n";
    assert_eq!(harness.eval(source), "A\n# A\n");
}

#[test]
fn json_files_autoparse() {
    let harness = Harness::new().file("/cfg.json", "{\"port\": 8080}");
    assert_eq!(
        harness.eval("/var @cfg = <cfg.json>\n/show @cfg.port\n"),
        "8080\n"
    );
}

#[test]
fn jsonl_parse_errors_name_the_line() {
    // Bad JSONL reports the line number and a prefix of the offending line
    let harness = Harness::new()
        .strict()
        .file("/x.jsonl", "{\"ok\":1}\n{bad}\n");
    let err = harness.run("/var @v = <x.jsonl>\n").unwrap_err();
    assert_eq!(err.code(), "DIRECTIVE_ERROR");
    let message = err.to_string();
    assert!(message.contains("line 2"), "message was: {message}");
    assert!(message.contains("{bad}"), "message was: {message}");
}

#[test]
fn jsonl_rows_parse_into_an_array() {
    let harness = Harness::new().file("/rows.jsonl", "{\"n\":1}\n{\"n\":2}\n");
    assert_eq!(
        harness.eval("/var @rows = <rows.jsonl>\n/show @rows.data.length\n"),
        "2\n"
    );
}

#[test]
fn section_extraction_by_heading() {
    let body = "# Guide\n\n## Usage\nuse it well\n\n## Install\nnever mind\n";
    let harness = Harness::new().file("/guide.md", body);
    assert_eq!(
        harness.eval("/var @s = <guide.md # Usage>\n/show @s\n"),
        "## Usage\nuse it well\n"
    );
}

#[test]
fn missing_section_is_a_directive_error() {
    let harness = Harness::new().strict().file("/guide.md", "# Guide\n");
    let err = harness.run("/var @s = <guide.md # Nope>\n").unwrap_err();
    assert_eq!(err.code(), "DIRECTIVE_ERROR");
    assert!(err.to_string().contains("Nope"));
}

#[test]
fn glob_loads_join_with_blank_lines() {
    let harness = Harness::new()
        .file("/docs/a.md", "alpha\n")
        .file("/docs/b.md", "beta\n");
    assert_eq!(
        harness.eval("/var @all = <docs/*.md>\n/show @all\n"),
        "alpha\n\n\nbeta\n"
    );
}

#[test]
fn empty_glob_is_an_empty_array() {
    let harness = Harness::new();
    let source = "/var @none = <missing/*.md>\n/show @none.length\n";
    assert_eq!(harness.eval(source), "0\n");
}

#[test]
fn rename_pattern_rewrites_each_element() {
    // `as` rename with frontmatter and relative-path placeholders
    let harness = Harness::new()
        .file("/docs/a.md", "---\nname: A\n---\n# A\n")
        .file("/docs/b.md", "---\nname: B\n---\n# B\n");
    let source = "/var @m = <docs/*.md> as \"### <>.fm.name (<>.relative)\"\n/show @m\n";
    assert_eq!(
        harness.eval(source),
        "### A (docs/a.md)\n\n### B (docs/b.md)\n"
    );
}

#[test]
fn metadata_broadcasts_over_glob_arrays() {
    let harness = Harness::new()
        .file("/docs/a.md", "A\n")
        .file("/docs/b.md", "B\n");
    let source = "/var @all = <docs/*.md>\n/show @all.relative\n";
    assert_eq!(harness.eval(source), "[\"docs/a.md\",\"docs/b.md\"]\n");
}

#[test]
fn definition_selectors_preserve_request_order_with_nulls() {
    let code = "export function connect() {\n  return open();\n}\n\nfunction close() {\n  connect();\n}\n";
    let harness = Harness::new().file("/src/net.ts", code);
    let source = "/var @defs = <src/net.ts { connect, ghost }>\n/show @defs[0].name\n/show @defs[1] == null\n";
    assert_eq!(harness.eval(source), "connect\ntrue\n");
}

#[test]
fn usage_selector_finds_referencing_definitions() {
    let code = "function close() {}\nfunction shutdown() {\n  close();\n}\n";
    let harness = Harness::new().file("/src/net.ts", code);
    let source = "/var @defs = <src/net.ts { (close) }>\n/show @defs[0].name\n";
    assert_eq!(harness.eval(source), "shutdown\n");
}

#[test]
fn url_loads_extract_html_metadata() {
    let html = "<html><head><title>Widget Docs</title></head><body><h1>Widgets</h1><p>All about widgets.</p></body></html>";
    let harness = Harness::new().allow_urls().http(
        ScriptedHttpClient::new().with_response("https://docs.example.com/widgets", "text/html", html),
    );
    let source = "/var @page = <https://docs.example.com/widgets>\n/show @page.title\n/show @page.domain\n";
    assert_eq!(harness.eval(source), "Widget Docs\ndocs.example.com\n");
}

#[test]
fn url_loads_require_the_flag() {
    let harness = Harness::new().strict();
    let err = harness
        .run("/var @page = <https://docs.example.com/x>\n")
        .unwrap_err();
    assert_eq!(err.code(), "SECURITY_ERROR");
}

#[test]
fn token_estimates_follow_kb_rates() {
    let content = "a".repeat(1024);
    let harness = Harness::new().file("/big.md", &content);
    assert_eq!(
        harness.eval("/var @f = <big.md>\n/show @f.tokens\n"),
        "750\n"
    );
}
