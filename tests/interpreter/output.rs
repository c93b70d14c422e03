//! `/output` routing, `/bail`, and rendered formats

use std::path::Path;

use pretty_assertions::assert_eq;

use mlld::{InterpreterOptions, MlldError, OutputFormat, OutputStream};

use super::Harness;

#[test]
fn output_to_file_writes_through_the_filesystem() {
    let harness = Harness::new();
    harness.eval("/var @x = \"saved\"\n/output @x to \"out/result.txt\"\n");
    assert_eq!(
        harness.fs.written(Path::new("/out/result.txt")).as_deref(),
        Some("saved")
    );
}

#[test]
fn output_json_format_serializes_data() {
    let harness = Harness::new();
    harness.eval("/var @o = {\"a\": 1}\n/output @o to \"o.json\" as json\n");
    assert_eq!(
        harness.fs.written(Path::new("/o.json")).as_deref(),
        Some("{\"a\":1}")
    );
}

#[test]
fn output_to_streams_is_collected_for_the_host() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    interp
        .run_source(
            "/var @x = \"to out\"\n/output @x to stdout\n/output @x to stderr\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap();
    let streams = interp.stream_outputs();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0], (OutputStream::Stdout, "to out".to_string()));
    assert_eq!(streams[1], (OutputStream::Stderr, "to out".to_string()));
}

#[test]
fn output_to_env_prefixes_the_name() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    interp
        .run_source(
            "/var @x = \"v\"\n/output @x to env RESULT\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap();
    assert_eq!(
        interp.env_outputs().get("MLLD_RESULT").map(String::as_str),
        Some("v")
    );
}

#[test]
fn output_document_target_is_a_no_op() {
    let harness = Harness::new();
    assert_eq!(
        harness.eval("/var @x = 1\n/output @x to document\ntext\n"),
        "text\n"
    );
}

#[test]
fn structured_values_emit_text_unless_json_requested() {
    let harness = Harness::new().file("/d.json", "{\"a\": 1}");
    harness.eval("/var @d = <d.json>\n/output @d to \"copy.txt\"\n/output @d to \"copy.json\" as json\n");
    assert_eq!(
        harness.fs.written(Path::new("/copy.txt")).as_deref(),
        Some("{\"a\": 1}")
    );
    assert_eq!(
        harness.fs.written(Path::new("/copy.json")).as_deref(),
        Some("{\"a\":1}")
    );
}

#[test]
fn bail_stops_evaluation_with_exit_code_two() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    let err = interp
        .run_source(
            "before\n/bail \"enough\"\nafter\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap_err();
    let MlldError::Bail { message } = &err else {
        panic!("expected bail, got {err}");
    };
    assert_eq!(message, "enough");
    assert_eq!(err.exit_code(), 2);
    // Output up to the bail is preserved
    assert_eq!(interp.output(), "before\n");
}

#[test]
fn xml_format_wraps_and_escapes() {
    let harness = Harness::new();
    let mut options = InterpreterOptions::default();
    options.base_path = "/".into();
    options.format = OutputFormat::Xml;
    let mut interp = mlld::Interpreter::with_platform(
        options,
        std::rc::Rc::clone(&harness.fs) as _,
        std::rc::Rc::clone(&harness.http) as _,
        std::rc::Rc::clone(&harness.runner) as _,
        std::rc::Rc::new(mlld::platform::StdClock),
    );
    let out = interp
        .run_source("a < b\n", Some(Path::new("/doc.mld")))
        .unwrap();
    assert_eq!(out, "<document>\na &lt; b\n</document>\n");
}

#[test]
fn pretty_objects_render_indented() {
    let mut harness = Harness::new();
    harness.options.pretty = true;
    let out = harness.eval("/var @o = {\"a\": 1}\n/show @o\n");
    assert_eq!(out, "{\n  \"a\": 1\n}\n");
}
