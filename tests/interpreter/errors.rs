//! Error propagation policy, rendering, and guard/bail behavior

use pretty_assertions::assert_eq;

use super::{eval, Harness};

#[test]
fn undefined_variable_is_a_resolution_error() {
    let err = Harness::new().strict().run("/show @ghost\n").unwrap_err();
    assert_eq!(err.code(), "RESOLUTION_ERROR");
    assert!(err.to_string().contains("@ghost"));
}

#[test]
fn permissive_mode_continues_with_a_placeholder() {
    let out = eval("/show @ghost\nstill here\n");
    assert_eq!(out, "[directive output placeholder]\nstill here\n");
}

#[test]
fn strict_mode_stops_at_the_first_failure() {
    let err = Harness::new()
        .strict()
        .run("/show @ghost\nnever reached\n")
        .unwrap_err();
    assert_eq!(err.code(), "RESOLUTION_ERROR");
}

#[test]
fn errors_carry_the_directive_location() {
    let err = Harness::new()
        .strict()
        .run("fine\n/show @ghost\n")
        .unwrap_err();
    let location = err.location().expect("location");
    assert_eq!(location.line, 2);
}

#[test]
fn render_with_source_draws_a_caret() {
    let harness = Harness::new().strict();
    let mut interp = harness.interpreter();
    let source = "fine\n/show @ghost\nmore\n";
    let err = interp
        .run_source(source, Some(std::path::Path::new("/doc.mld")))
        .unwrap_err();
    let rendered = err.render_with_source(interp.cached_source(std::path::Path::new("/doc.mld")));
    assert!(rendered.contains("ResolutionError"));
    assert!(rendered.contains("2 | /show @ghost"));
    assert!(rendered.contains('^'));
}

#[test]
fn parse_errors_name_the_unexpected_token() {
    let err = Harness::new().run("/var @x = = 1\n").unwrap_err();
    assert_eq!(err.code(), "PARSE_ERROR");
}

#[test]
fn null_bytes_in_paths_are_rejected() {
    let err = Harness::new()
        .strict()
        .run("/path @p = \"bad\u{0}path\"\n")
        .unwrap_err();
    assert_eq!(err.code(), "PATH_VALIDATION");
}

#[test]
fn dot_segments_require_a_path_variable_base() {
    let err = Harness::new()
        .strict()
        .run("/path @p = \"../escape\"\n")
        .unwrap_err();
    assert_eq!(err.code(), "PATH_VALIDATION");
}

#[test]
fn guard_allows_and_aborts_operations() {
    let allowed = "/guard for exe = when [\n  * => \"allow\"\n]\n/exe @f() = `ok`\n/show @f()\n";
    assert_eq!(eval(allowed), "ok\n");

    let denied = "/guard for exe = when [\n  @ctx.name == \"f\" => \"f is forbidden\"\n  * => \"allow\"\n]\n/exe @f() = `ok`\n/show @f()\n";
    let err = Harness::new().strict().run(denied).unwrap_err();
    assert_eq!(err.code(), "BAIL");
    assert!(err.to_string().contains("forbidden"));
}

#[test]
fn guard_on_pipeline_stages_sees_the_stage_name() {
    let source = "/guard for pipeline:stage = when [\n  @ctx.name == \"blocked\" => \"no blocked stages\"\n  * => \"allow\"\n]\n/exe @blocked(input) = `x`\n/exe @seed() = `s`\n/var @r = @seed() | @blocked\n";
    let err = Harness::new().strict().run(source).unwrap_err();
    assert_eq!(err.code(), "BAIL");
}

#[test]
fn missing_file_load_is_recoverable_in_permissive_mode() {
    let out = eval("/show <nope.md>\nstill here\n");
    assert_eq!(out, "[directive output placeholder]\nstill here\n");
}

#[test]
fn cancellation_surfaces_with_exit_code_three() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    interp.set_cancellation(std::rc::Rc::new(|| true));
    let err = interp
        .run_source("text\n", Some(std::path::Path::new("/doc.mld")))
        .unwrap_err();
    assert_eq!(err.code(), "CANCELLED");
    assert_eq!(err.exit_code(), 3);
}
