use std::path::Path;

use crate::error::{OtscError, Result};
use crate::types::name_of;

/// Maps source files to fully-qualified identifiers and resolves partial
/// references against the known-entity map.
#[derive(Debug, Clone)]
pub struct NameResolver;

impl NameResolver {
    pub fn new() -> Self {
        Self
    }

    /// `models/<schema>/<stem>.<ext>` resolves to `schema.stem`; a file
    /// directly under the role folder resolves to the bare stem.
    pub fn qualified_name(&self, source_file: &Path, role_folder: &Path) -> Result<String> {
        let stem = source_file
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| OtscError::TableResolution {
                file: source_file.to_path_buf(),
                message: "file has no usable stem".to_string(),
            })?;
        Ok(match self.schema_for(source_file, role_folder)? {
            Some(schema) => format!("{schema}.{stem}"),
            None => stem.to_string(),
        })
    }

    /// Qualified identifier for an entity declared inside a script file:
    /// the directory-derived schema plus the declared name.
    pub fn qualified_name_for(
        &self,
        source_file: &Path,
        role_folder: &Path,
        declared_name: &str,
    ) -> Result<String> {
        // a declared name may already carry its schema
        if declared_name.contains('.') {
            return Ok(declared_name.to_string());
        }
        Ok(match self.schema_for(source_file, role_folder)? {
            Some(schema) => format!("{schema}.{declared_name}"),
            None => declared_name.to_string(),
        })
    }

    /// Qualified identifier for a function. An explicit `schema` in the
    /// function's metadata overrides the directory-derived schema.
    pub fn function_name(
        &self,
        source_file: &Path,
        functions_folder: &Path,
        metadata_schema: Option<&str>,
        function_name: &str,
    ) -> Result<String> {
        if function_name.contains('.') {
            return Ok(function_name.to_string());
        }
        if let Some(schema) = metadata_schema {
            return Ok(format!("{schema}.{function_name}"));
        }
        Ok(match self.schema_for(source_file, functions_folder)? {
            Some(schema) => format!("{schema}.{function_name}"),
            None => function_name.to_string(),
        })
    }

    /// Schema component implied by the file's location under the role
    /// folder, None for files placed directly in it.
    pub fn schema_for(&self, source_file: &Path, role_folder: &Path) -> Result<Option<String>> {
        let relative = source_file
            .strip_prefix(role_folder)
            .map_err(|_| OtscError::TableResolution {
                file: source_file.to_path_buf(),
                message: format!("file is not under {}", role_folder.display()),
            })?;
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        if parts.len() >= 2 {
            Ok(Some(parts[0].to_string()))
        } else {
            Ok(None)
        }
    }

    /// Resolve a partial reference against the known identifiers: an exact
    /// match wins; otherwise a unique last-segment match; otherwise None
    /// (the reference is external and stays as written).
    pub fn resolve_reference<'a, I>(&self, reference: &str, known: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut last_segment_match: Option<&str> = None;
        let mut ambiguous = false;
        let target = name_of(reference);

        for candidate in known {
            if candidate == reference {
                return Some(candidate.clone());
            }
            if name_of(candidate) == target {
                if last_segment_match.is_some() {
                    ambiguous = true;
                } else {
                    last_segment_match = Some(candidate);
                }
            }
        }

        if ambiguous {
            None
        } else {
            last_segment_match.map(String::from)
        }
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_qualified_name_from_schema_directory() {
        let resolver = NameResolver::new();
        let name = resolver
            .qualified_name(
                Path::new("proj/models/my_schema/orders.sql"),
                Path::new("proj/models"),
            )
            .unwrap();
        assert_eq!(name, "my_schema.orders");
    }

    #[test]
    fn test_bare_stem_for_files_directly_under_models() {
        let resolver = NameResolver::new();
        let name = resolver
            .qualified_name(Path::new("proj/models/orders.sql"), Path::new("proj/models"))
            .unwrap();
        assert_eq!(name, "orders");
    }

    #[test]
    fn test_declared_name_gets_directory_schema() {
        let resolver = NameResolver::new();
        let name = resolver
            .qualified_name_for(
                Path::new("proj/models/my_schema/generated.py"),
                Path::new("proj/models"),
                "users_summary",
            )
            .unwrap();
        assert_eq!(name, "my_schema.users_summary");
    }

    #[test]
    fn test_metadata_schema_overrides_directory() {
        let resolver = NameResolver::new();
        let name = resolver
            .function_name(
                Path::new("proj/functions/other/clean.sql"),
                Path::new("proj/functions"),
                Some("util"),
                "clean",
            )
            .unwrap();
        assert_eq!(name, "util.clean");
    }

    #[test]
    fn test_file_outside_role_folder_fails() {
        let resolver = NameResolver::new();
        let err = resolver
            .qualified_name(Path::new("elsewhere/orders.sql"), Path::new("proj/models"))
            .unwrap_err();
        assert!(matches!(err, OtscError::TableResolution { .. }));
    }

    #[test]
    fn test_resolve_exact_match() {
        let resolver = NameResolver::new();
        let ids = known(&["my_schema.orders", "staging.orders_raw"]);
        assert_eq!(
            resolver.resolve_reference("my_schema.orders", &ids),
            Some("my_schema.orders".to_string())
        );
    }

    #[test]
    fn test_resolve_unique_last_segment() {
        let resolver = NameResolver::new();
        let ids = known(&["my_schema.orders", "staging.customers"]);
        assert_eq!(
            resolver.resolve_reference("orders", &ids),
            Some("my_schema.orders".to_string())
        );
    }

    #[test]
    fn test_ambiguous_reference_is_external() {
        let resolver = NameResolver::new();
        let ids = known(&["a.orders", "b.orders"]);
        assert_eq!(resolver.resolve_reference("orders", &ids), None);
    }

    #[test]
    fn test_unknown_reference_is_external() {
        let resolver = NameResolver::new();
        let ids = known(&["a.orders"]);
        assert_eq!(resolver.resolve_reference("raw_events", &ids), None);
    }
}
