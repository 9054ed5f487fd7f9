mod common;

use common::ProjectFixture;
use otsc::OutputFormat;
use serde_json::json;

#[test]
fn test_attached_tests_become_graph_nodes() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/t.sql", "SELECT 1 AS id");
    fixture.write(
        "models/a/t.py",
        r#"
metadata = {
    "description": "Test host table",
    "schema": [
        {"name": "id", "datatype": "number", "tests": ["not_null"]},
    ],
    "tests": ["row_count_gt_0"],
}
"#,
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let nodes = &result.graph.nodes;
    assert!(nodes.contains(&"a.t".to_string()));
    assert!(nodes.contains(&"test:a.t.id.not_null".to_string()));
    assert!(nodes.contains(&"test:a.t.row_count_gt_0".to_string()));

    assert_eq!(
        result.graph.dependencies["test:a.t.id.not_null"],
        vec!["a.t"]
    );
    assert_eq!(
        result.graph.dependencies["test:a.t.row_count_gt_0"],
        vec!["a.t"]
    );

    let order = &result.execution_order;
    let host = order.iter().position(|n| n == "a.t").unwrap();
    let col_test = order
        .iter()
        .position(|n| n == "test:a.t.id.not_null")
        .unwrap();
    let table_test = order
        .iter()
        .position(|n| n == "test:a.t.row_count_gt_0")
        .unwrap();
    assert!(host < col_test);
    assert!(host < table_test);
}

#[test]
fn test_generic_sql_test_references_other_tables() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/t.sql", "SELECT 1 AS id");
    fixture.write("models/a/other.sql", "SELECT 2 AS id");
    fixture.write(
        "models/a/t.py",
        r#"
metadata = {
    "tests": ["orphans"],
}
"#,
    );
    fixture.write(
        "tests/orphans.sql",
        "SELECT t1.id FROM @table_name t1 LEFT JOIN a.other t2 ON t1.id = t2.id WHERE t2.id IS NULL",
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let mut predecessors = result.graph.dependencies["test:a.t.orphans"].clone();
    predecessors.sort();
    assert_eq!(predecessors, vec!["a.other", "a.t"]);
}

#[test]
fn test_attachments_survive_emission() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/t.sql", "SELECT 1 AS id, 'x' AS state");
    fixture.write(
        "models/a/t.py",
        r#"
metadata = {
    "schema": [
        {"name": "id", "datatype": "number", "tests": ["not_null"]},
        {"name": "state", "datatype": "string", "tests": [
            {"name": "accepted_values", "values": ["x", "y"], "severity": "warning"},
        ]},
    ],
    "tests": ["no_duplicates"],
}
"#,
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let module: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&result.exported_paths["t_project.a"]).unwrap(),
    )
    .unwrap();
    let tests = &module["transformations"][0]["tests"];
    assert_eq!(tests["columns"]["id"], json!(["not_null"]));
    assert_eq!(
        tests["columns"]["state"][0]["name"],
        json!("accepted_values")
    );
    assert_eq!(
        tests["columns"]["state"][0]["values"],
        json!(["x", "y"])
    );
    assert_eq!(tests["columns"]["state"][0]["severity"], json!("warning"));
    // the legacy alias is normalized at the table level
    assert_eq!(tests["table"], json!(["unique"]));
}

#[test]
fn test_test_library_emitted_with_parameters() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/t.sql", "SELECT 1 AS id");
    fixture.write(
        "tests/minimum_rows.sql",
        "-- Table must have a minimum number of rows\nSELECT 1 FROM @table_name HAVING COUNT(*) < @min_rows:10",
    );
    fixture.write(
        "tests/orders_positive.sql",
        "SELECT id FROM a.t WHERE id < 0",
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let library: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(result.test_library_path.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    assert_eq!(library["ots_version"], json!("0.2.0"));
    assert_eq!(library["test_library_version"], json!("1.0"));

    let minimum_rows = &library["generic_tests"]["minimum_rows"];
    assert_eq!(minimum_rows["type"], json!("sql"));
    assert_eq!(minimum_rows["level"], json!("table"));
    assert_eq!(
        minimum_rows["description"],
        json!("Table must have a minimum number of rows")
    );
    assert_eq!(
        minimum_rows["parameters"]["min_rows"]["type"],
        json!("number")
    );
    assert_eq!(minimum_rows["parameters"]["min_rows"]["default"], json!(10));
    // comments are stripped from the stored SQL
    assert!(!minimum_rows["sql"].as_str().unwrap().contains("--"));

    let singular = &library["singular_tests"]["orders_positive"];
    assert_eq!(singular["target_transformation"], json!("a.t"));
}

#[test]
fn test_metadata_companion_test_in_tests_folder() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/t.sql", "SELECT 'abc' AS name");
    fixture.write(
        "tests/check_name_length.sql",
        "SELECT name FROM @table_name WHERE LENGTH(name) > 100",
    );
    fixture.write(
        "tests/check_name_length.py",
        r#"
metadata = {
    "name": "check_name_length",
    "severity": "error",
    "description": "Check that name column values are not too long",
    "tags": ["data-quality", "column-validation"],
}

test = SqlTestMetadata(**metadata)
"#,
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let library: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(result.test_library_path.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    let test = &library["generic_tests"]["check_name_length"];
    assert_eq!(
        test["description"],
        json!("Check that name column values are not too long")
    );
    assert!(test["sql"].as_str().unwrap().contains("@table_name"));
}

#[test]
fn test_function_level_test_nodes() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("functions/util/clean.sql", "SELECT TRIM(value)");
    fixture.write(
        "functions/util/clean.py",
        r#"
metadata = {
    "function_name": "clean",
    "function_type": "scalar",
    "return_type": "VARCHAR",
    "parameters": [{"name": "value", "type": "VARCHAR"}],
    "tests": ["returns_trimmed"],
}
"#,
    );
    fixture.write(
        "tests/returns_trimmed.sql",
        "SELECT 1 WHERE @function_name('  x  ') <> 'x'",
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    assert!(result
        .graph
        .nodes
        .contains(&"test:util.clean.returns_trimmed".to_string()));
    assert_eq!(
        result.graph.dependencies["test:util.clean.returns_trimmed"],
        vec!["util.clean"]
    );
    let order = &result.execution_order;
    let function = order.iter().position(|n| n == "util.clean").unwrap();
    let test = order
        .iter()
        .position(|n| n == "test:util.clean.returns_trimmed")
        .unwrap();
    assert!(function < test);
}
