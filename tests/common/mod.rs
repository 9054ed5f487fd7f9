#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use otsc::Compiler;

/// A scratch project tree for end-to-end compilation tests
pub struct ProjectFixture {
    dir: TempDir,
}

impl ProjectFixture {
    /// Empty project with a default duckdb configuration
    pub fn new(project_name: &str) -> Self {
        let fixture = Self {
            dir: TempDir::new().expect("create fixture directory"),
        };
        fixture.write(
            "project.toml",
            &format!(
                "name = \"{project_name}\"\nproject_folder = \"{project_name}\"\n\n[connection]\ntype = \"duckdb\"\n"
            ),
        );
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file under the project root, creating parents as needed
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).expect("create parent dirs");
        fs::write(&path, content).expect("write fixture file");
        path
    }

    /// Replace the project configuration wholesale
    pub fn set_config(&self, toml: &str) {
        self.write("project.toml", toml);
    }

    pub fn compiler(&self) -> Compiler {
        Compiler::load(self.root()).expect("load compiler")
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.dir.path().join("output").join("ots_modules")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }
}
