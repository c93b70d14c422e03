//! Import resolution, binding, cycles, and export manifests

use std::path::Path;

use pretty_assertions::assert_eq;

use super::Harness;

#[test]
fn selected_import_binds_named_variables() {
    let harness = Harness::new().file("/lib.mld", "/var @greeting = \"hello\"\n/var @count = 2\n");
    let source = "/import { greeting } from \"./lib.mld\"\n/show @greeting\n";
    assert_eq!(harness.eval(source), "hello\n");
}

#[test]
fn import_alias_renames_the_binding() {
    let harness = Harness::new().file("/lib.mld", "/var @greeting = \"hello\"\n");
    let source = "/import { greeting as hi } from \"./lib.mld\"\n/show @hi\n";
    assert_eq!(harness.eval(source), "hello\n");
}

#[test]
fn namespace_import_binds_one_object() {
    let harness = Harness::new()
        .file("/lib.mld", "/var @greeting = \"hello\"\n/exe @shout(s) = `@s!`\n");
    let source = "/import \"./lib.mld\" as @lib\n/show @lib.greeting\n/show @lib.shout(\"hey\")\n";
    assert_eq!(harness.eval(source), "hello\nhey!\n");
}

#[test]
fn wildcard_import_copies_all_exports() {
    let harness = Harness::new().file("/lib.mld", "/var @a = 1\n/var @b = 2\n");
    let source = "/import \"./lib.mld\"\n/show @a\n/show @b\n";
    assert_eq!(harness.eval(source), "1\n2\n");
}

#[test]
fn missing_export_is_an_import_error() {
    let harness = Harness::new().strict().file("/lib.mld", "/var @a = 1\n");
    let err = harness
        .run("/import { nope } from \"./lib.mld\"\n")
        .unwrap_err();
    assert_eq!(err.code(), "EXPORT_MISSING");
    assert!(err.to_string().contains("nope"));
}

#[test]
fn circular_import_is_detected() {
    // a.mld -> b.mld -> a.mld
    let harness = Harness::new()
        .strict()
        .file("/a.mld", "/import { x } from \"./b.mld\"\n")
        .file("/b.mld", "/import { y } from \"./a.mld\"\n/var @y = \"v\"\n");
    let source = harness.fs.written(Path::new("/a.mld")).unwrap();
    let err = harness
        .interpreter()
        .run_source(&source, Some(Path::new("/a.mld")))
        .unwrap_err();
    assert_eq!(err.code(), "CIRCULAR_IMPORT");
    let mlld::MlldError::Import { path, .. } = &err else {
        panic!("expected an import error, got {err}");
    };
    assert!(path.ends_with("b.mld"), "path was {path}");
}

#[test]
fn module_show_output_stays_in_the_module() {
    let harness = Harness::new().file("/noisy.mld", "/var @x = 1\n/show \"from module\"\n");
    let source = "/import { x } from \"./noisy.mld\"\n/show @x\n";
    assert_eq!(harness.eval(source), "1\n");
}

#[test]
fn imported_variables_remember_their_import_site() {
    let harness = Harness::new().file("/lib.mld", "/var @a = 1\n");
    let source = "/import { a } from \"./lib.mld\"\n/show @a.metadata.importPath\n";
    assert_eq!(harness.eval(source), "./lib.mld\n");
}

#[test]
fn export_manifest_restricts_and_validates() {
    let harness = Harness::new()
        .file("/lib.mld", "/var @public = 1\n/var @hidden = 2\n/export { public }\n");
    let ok = "/import { public } from \"./lib.mld\"\n/show @public\n";
    assert_eq!(harness.eval(ok), "1\n");
    let err = Harness::new()
        .strict()
        .file("/lib.mld", "/var @public = 1\n/export { public }\n")
        .run("/import { hidden } from \"./lib.mld\"\n")
        .unwrap_err();
    assert_eq!(err.code(), "EXPORT_MISSING");
}

#[test]
fn manifest_naming_an_undefined_variable_fails() {
    let harness = Harness::new()
        .strict()
        .file("/lib.mld", "/var @a = 1\n/export { a, ghost }\n");
    let err = harness.run("/import { a } from \"./lib.mld\"\n").unwrap_err();
    assert_eq!(err.code(), "EXPORT_MISSING");
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn module_prefix_resolution() {
    let harness = Harness::new().file("/modules/tools.mld", "/var @version = \"1.2\"\n");
    let mut interp = harness.interpreter();
    interp
        .resolvers_mut()
        .register_module_root("local", "/modules");
    let out = interp
        .run_source(
            "/import { version } from @local/tools\n/show @version\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap();
    assert_eq!(out, "1.2\n");
}

#[test]
fn input_resolver_provides_host_payload() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    interp
        .resolvers_mut()
        .set_input("{\"env\": \"test\", \"n\": 1}");
    let out = interp
        .run_source(
            "/import { env } from @INPUT\n/show @env\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap();
    assert_eq!(out, "test\n");
}

#[test]
fn mld_md_modules_only_run_fenced_regions() {
    let module = "---\nname: demo\n---\nThis prose is ignored.\n```mlld-run\n/var @fenced = \"yes\"\n```\nMore prose.\n";
    let harness = Harness::new().file("/mod.mld.md", module);
    let source = "/import { fenced } from \"./mod.mld.md\"\n/show @fenced\n";
    assert_eq!(harness.eval(source), "yes\n");
}

#[test]
fn failed_import_leaves_the_environment_unchanged() {
    let harness = Harness::new()
        .file("/a.mld", "/import { x } from \"./b.mld\"\n")
        .file("/b.mld", "/import { y } from \"./a.mld\"\n/var @y = \"v\"\n");
    // Permissive mode: the import fails but evaluation continues, and
    // nothing from the failed import is bound
    let source = "/import { y } from \"./b.mld\"\n/show \"still here\"\n";
    let out = harness.eval(source);
    assert_eq!(out, "still here\n");
}
