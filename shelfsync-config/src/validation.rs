//! Pre-flight checks run before any CLI command drives the core.

use crate::models::Config;

/// Validates that a library root looks like a usable filesystem path.
pub fn validate_library_root(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("library root must not be empty".to_string());
    }

    let looks_like_path = trimmed.starts_with('/')
        || trimmed.starts_with("./")
        || trimmed.starts_with("~/")
        || trimmed.starts_with("../")
        || (trimmed.len() >= 3 && trimmed.as_bytes()[1] == b':' && matches!(trimmed.as_bytes()[2], b'\\' | b'/'));

    if !looks_like_path {
        return Err(format!(
            "library root must be an absolute or explicitly relative path, got '{trimmed}'"
        ));
    }
    Ok(())
}

/// Validates a store name: non-empty, and free of the path-separator
/// character the identity contract uses internally for the
/// `<prefix>-<suffix>` doc-id split.
pub fn validate_store_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("store name must not be empty".to_string());
    }
    if trimmed.contains('\n') {
        return Err("store name must not contain newlines".to_string());
    }
    Ok(())
}

pub fn validate_base_url(url: &str) -> Result<(), String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err("remote base URL must not be empty".to_string());
    }
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(format!("remote base URL must start with http:// or https://, got '{trimmed}'"));
    }
    Ok(())
}

/// Runs every pre-flight check against a fully loaded config, collecting
/// all failures rather than stopping at the first (so a misconfigured
/// operator sees the whole list in one pass).
pub fn apply_guard_rails(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    match &config.library.root {
        Some(root) => {
            if let Err(e) = validate_library_root(&root.to_string_lossy()) {
                errors.push(e);
            }
        }
        None => errors.push("library root is not configured".to_string()),
    }

    if let Err(e) = validate_store_name(&config.remote.store_name) {
        errors.push(e);
    }
    if let Err(e) = validate_base_url(&config.remote.base_url) {
        errors.push(e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_root_accepts_absolute_and_explicit_relative_paths() {
        assert!(validate_library_root("/mnt/library").is_ok());
        assert!(validate_library_root("./library").is_ok());
        assert!(validate_library_root("~/library").is_ok());
        assert!(validate_library_root("../library").is_ok());
    }

    #[test]
    fn library_root_rejects_bare_relative_paths_and_empty_string() {
        assert!(validate_library_root("library").is_err());
        assert!(validate_library_root("").is_err());
    }

    #[test]
    fn base_url_requires_a_scheme() {
        assert!(validate_base_url("https://search.example.com").is_ok());
        assert!(validate_base_url("search.example.com").is_err());
        assert!(validate_base_url("").is_err());
    }

    #[test]
    fn guard_rails_reports_every_failure_in_one_pass() {
        let mut config = Config::default();
        config.library.root = None;
        config.remote.store_name = String::new();
        config.remote.base_url = "not-a-url".to_string();

        let errors = apply_guard_rails(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
