mod common;

use common::ProjectFixture;
use otsc::{OtscError, OutputFormat};
use serde_json::json;

fn imported_module_json(schema: &str, transformation_id: &str) -> String {
    json!({
        "ots_version": "0.2.1",
        "module_name": format!("other.{schema}"),
        "module_description": format!("Transformations for {schema} schema"),
        "target": {"database": "other", "schema": schema, "sql_dialect": "duckdb"},
        "transformations": [{
            "transformation_id": transformation_id,
            "description": "Shared table",
            "transformation_type": "sql",
            "sql_dialect": "duckdb",
            "code": {"sql": {
                "original_sql": "SELECT 1 AS id",
                "resolved_sql": "SELECT 1 AS id",
                "source_tables": [],
                "source_functions": []
            }},
            "materialization": {"type": "table"},
            "metadata": {"file_path": "models/shared.sql"}
        }]
    })
    .to_string()
}

#[test]
fn test_imported_module_merges_into_compilation() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/x.sql", "SELECT * FROM ext.shared");
    fixture.write("models/ext/shared.ots.json", &imported_module_json("ext", "ext.shared"));

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    assert_eq!(result.parsed_model_count, 1);
    assert_eq!(result.imported_count, 1);
    assert_eq!(result.total_transformations, 2);
    // the imported transformation orders before its dependent
    assert_eq!(result.execution_order, vec!["ext.shared", "a.x"]);
    // per-schema emission covers the imported schema too
    assert!(result.exported_paths.contains_key("t_project.ext"));
}

#[test]
fn test_import_conflict_is_fatal_and_names_duplicates() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/x.sql", "SELECT 1 AS id");
    fixture.write("models/a/shared.ots.json", &imported_module_json("a", "a.x"));

    let mut compiler = fixture.compiler();
    let err = compiler.compile(OutputFormat::Json).unwrap_err();
    match err {
        OtscError::Compilation { identifiers, .. } => {
            assert_eq!(identifiers, vec!["a.x"]);
        }
        other => panic!("expected Compilation error, got {other:?}"),
    }
}

#[test]
fn test_duplicate_across_imported_modules_is_fatal() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/ext/one.ots.json", &imported_module_json("ext", "ext.shared"));
    fixture.write("models/ext/two.ots.json", &imported_module_json("ext", "ext.shared"));

    let mut compiler = fixture.compiler();
    let err = compiler.compile(OutputFormat::Json).unwrap_err();
    match err {
        OtscError::Compilation { identifiers, .. } => {
            assert_eq!(identifiers, vec!["ext.shared"]);
        }
        other => panic!("expected Compilation error, got {other:?}"),
    }
}

#[test]
fn test_invalid_module_version_is_fatal() {
    let fixture = ProjectFixture::new("t_project");
    let mut module: serde_json::Value =
        serde_json::from_str(&imported_module_json("ext", "ext.shared")).unwrap();
    module["ots_version"] = json!("9.9.9");
    fixture.write("models/ext/bad.ots.json", &module.to_string());

    let mut compiler = fixture.compiler();
    let err = compiler.compile(OutputFormat::Json).unwrap_err();
    assert!(matches!(err, OtscError::OtsValidation { .. }));
}

#[test]
fn test_location_mismatch_warns_by_default_and_fails_when_strict() {
    let fixture = ProjectFixture::new("t_project");
    // module targets schema ext but lives under models/elsewhere/
    fixture.write(
        "models/elsewhere/shared.ots.json",
        &imported_module_json("ext", "ext.shared"),
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();
    assert_eq!(result.imported_count, 1);

    fixture.set_config(
        "name = \"t_project\"\nproject_folder = \"t_project\"\nstrict_module_location = true\n\n[connection]\ntype = \"duckdb\"\n",
    );
    let mut strict = fixture.compiler();
    let err = strict.compile(OutputFormat::Json).unwrap_err();
    assert!(matches!(err, OtscError::OtsValidation { .. }));
}

#[test]
fn test_imported_test_library_merges_first_party_wins() {
    let fixture = ProjectFixture::new("t_project");
    // first-party generic test with the same name as an imported one
    fixture.write(
        "tests/has_rows.sql",
        "SELECT 1 FROM @table_name HAVING COUNT(*) < 1",
    );
    fixture.write("models/a/x.sql", "SELECT 1 AS id");

    let mut module: serde_json::Value =
        serde_json::from_str(&imported_module_json("ext", "ext.shared")).unwrap();
    module["test_library_path"] = json!("ext_test_library.ots.json");
    fixture.write("models/ext/shared.ots.json", &module.to_string());
    fixture.write(
        "models/ext/ext_test_library.ots.json",
        &json!({
            "ots_version": "0.2.0",
            "test_library_version": "1.0",
            "description": "Test library for ext project",
            "generic_tests": {
                "has_rows": {
                    "type": "sql",
                    "level": "table",
                    "description": "imported duplicate",
                    "sql": "SELECT 'imported'"
                },
                "imported_only": {
                    "type": "sql",
                    "level": "table",
                    "description": null,
                    "sql": "SELECT 2 FROM @table_name"
                }
            }
        })
        .to_string(),
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let library_path = result.test_library_path.unwrap();
    assert!(library_path.ends_with("t_project_test_library.ots.json"));
    let library: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&library_path).unwrap()).unwrap();
    // first-party definition survives the collision
    assert!(library["generic_tests"]["has_rows"]["sql"]
        .as_str()
        .unwrap()
        .contains("@table_name"));
    assert!(library["generic_tests"]
        .as_object()
        .unwrap()
        .contains_key("imported_only"));

    // every emitted module references the merged library by file name
    let module: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&result.exported_paths["t_project.a"]).unwrap(),
    )
    .unwrap();
    assert_eq!(
        module["test_library_path"],
        json!("t_project_test_library.ots.json")
    );
}
