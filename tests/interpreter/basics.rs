//! Document rendering, literals, arithmetic, and field access

use pretty_assertions::assert_eq;

use super::{eval, Harness};

#[test]
fn plain_text_passes_through_unchanged() {
    let source = "# Title\n\nSome **markdown** text.\n";
    assert_eq!(eval(source), source);
}

#[test]
fn code_fences_are_opaque() {
    let source = "```js\n/var @not_evaluated = 1\n```\n";
    assert_eq!(eval(source), source);
    assert_eq!(
        eval("before\n```\n/show @x\n```\nafter\n"),
        "before\n```\n/show @x\n```\nafter\n"
    );
}

#[test]
fn frontmatter_is_reemitted() {
    let source = "---\ntitle: Demo\n---\nBody\n";
    assert_eq!(eval(source), source);
}

#[test]
fn comments_are_dropped() {
    assert_eq!(eval(">> a note to self\ntext\n"), "text\n");
}

#[test]
fn directive_lines_do_not_appear_in_output() {
    assert_eq!(eval("/var @x = 1\ntext\n"), "text\n");
}

#[test]
fn show_renders_literals() {
    assert_eq!(eval("/show \"hello\"\n"), "hello\n");
    assert_eq!(eval("/show 42\n"), "42\n");
    assert_eq!(eval("/show true\n"), "true\n");
    assert_eq!(eval("/show null\n"), "null\n");
}

#[test]
fn object_field_access_end_to_end() {
    let source =
        "/var @user = {\"name\":\"Alice\",\"age\":30}\n/show `name=@user.name age=@user.age`\n";
    assert_eq!(eval(source), "name=Alice age=30\n");
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(eval("/var @x = 1 + 2 * 3\n/show @x\n"), "7\n");
    assert_eq!(eval("/var @x = (1 + 2) * 3\n/show @x\n"), "9\n");
    assert_eq!(eval("/var @x = 10 % 4\n/show @x\n"), "2\n");
}

#[test]
fn division_by_zero_is_an_execution_error() {
    let err = Harness::new()
        .strict()
        .run("/var @x = 1 / 0\n")
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    assert!(err.to_string().contains("division by zero"));
}

#[test]
fn comparison_and_logic() {
    assert_eq!(eval("/show 1 < 2\n"), "true\n");
    assert_eq!(eval("/show 2 <= 1\n"), "false\n");
    assert_eq!(eval("/show \"a\" == \"a\"\n"), "true\n");
    assert_eq!(eval("/show 1 != 2\n"), "true\n");
    assert_eq!(eval("/show true && false\n"), "false\n");
    assert_eq!(eval("/show false || \"fallback\"\n"), "fallback\n");
    assert_eq!(eval("/show !false\n"), "true\n");
}

#[test]
fn ternary_expression() {
    assert_eq!(
        eval("/var @x = 5\n/show @x > 3 ? \"big\" : \"small\"\n"),
        "big\n"
    );
}

#[test]
fn string_concatenation_with_plus() {
    assert_eq!(eval("/show \"a\" + \"b\"\n"), "ab\n");
}

#[test]
fn array_indexing_including_negative() {
    let source = "/var @xs = [10, 20, 30]\n/show @xs[0]\n/show @xs[-1]\n/show @xs.length\n";
    assert_eq!(eval(source), "10\n30\n3\n");
}

#[test]
fn nested_field_chains() {
    let source = "/var @cfg = {\"servers\": [{\"host\": \"alpha\"}, {\"host\": \"beta\"}]}\n/show @cfg.servers[1].host\n";
    assert_eq!(eval(source), "beta\n");
}

#[test]
fn string_key_bracket_access() {
    let source = "/var @m = {\"some key\": \"v\"}\n/show @m[\"some key\"]\n";
    assert_eq!(eval(source), "v\n");
}

#[test]
fn reserved_type_field_reads_the_variable_record() {
    assert_eq!(eval("/var @s = \"hi\"\n/show @s.type\n"), "simple-text\n");
}

#[test]
fn objects_render_as_json() {
    assert_eq!(eval("/var @o = {\"a\": 1}\n/show @o\n"), "{\"a\":1}\n");
}

#[test]
fn later_bindings_shadow_earlier() {
    assert_eq!(eval("/var @x = 1\n/var @x = 2\n/show @x\n"), "2\n");
}

#[test]
fn failed_object_property_becomes_an_error_marker() {
    let source =
        "/var @o = {\"good\": 1, \"bad\": @missing}\n/show @o.good\n/show @o.bad.__error\n";
    assert_eq!(eval(source), "1\ntrue\n");
}

#[test]
fn path_directive_binds_resolved_paths() {
    let out = eval("/path @notes = \"$HOMEPATH/notes.md\"\n/show @notes\n");
    assert_eq!(out, "/home/user/notes.md\n");
}

#[test]
fn show_output_is_ordered_by_document_position() {
    let source = "first\n/show \"second\"\nthird\n";
    assert_eq!(eval(source), "first\nsecond\nthird\n");
}
