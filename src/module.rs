// File: src/module.rs
//
// Import path resolution. A bare module name searches the importing
// file's directory first and the interpreter's lib/ directory second; a
// string containing a path separator resolves relative to the importing
// file's directory. The VM caches loaded modules by the absolute path
// this module produces.

use std::path::{Path, PathBuf};

pub const SOURCE_SUFFIX: &str = ".aria";

fn looks_like_path(input: &str) -> bool {
    input.contains('/') || input.contains('\\')
}

/// Directory of the interpreter binary, for the lib/ search path.
fn program_directory() -> Option<PathBuf> {
    std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
}

/// Resolves an `import` input to the absolute path of an existing file.
pub fn resolve_module_path(input: &str, importing_dir: &Path) -> Result<PathBuf, String> {
    if looks_like_path(input) {
        let candidate = importing_dir.join(input);
        return candidate
            .canonicalize()
            .map_err(|_| format!("Failed to find module file '{}'", input));
    }

    let file_name = format!("{}{}", input, SOURCE_SUFFIX);
    let local = importing_dir.join(&file_name);
    if local.is_file() {
        return local.canonicalize().map_err(|_| format!("Failed to find module '{}'", input));
    }
    if let Some(program_dir) = program_directory() {
        let in_lib = program_dir.join("lib").join(&file_name);
        if in_lib.is_file() {
            return in_lib
                .canonicalize()
                .map_err(|_| format!("Failed to find module '{}'", input));
        }
    }
    Err(format!("Failed to find module '{}'", input))
}

/// Directory a source file lives in, made absolute; falls back to the
/// current working directory.
pub fn file_directory(path: &str) -> PathBuf {
    let path = Path::new(path);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(path)
    };
    absolute.parent().map(Path::to_path_buf).unwrap_or(absolute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn bare_name_resolves_in_importing_directory() {
        let dir = std::env::temp_dir().join("aria_module_test_bare");
        let _ = fs::create_dir_all(&dir);
        let file = dir.join("helper.aria");
        fs::write(&file, "var x = 1;").unwrap();
        let resolved = resolve_module_path("helper", &dir).unwrap();
        assert_eq!(resolved, file.canonicalize().unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_module_is_an_error() {
        let dir = std::env::temp_dir();
        assert!(resolve_module_path("definitely_not_a_module", &dir).is_err());
    }

    #[test]
    fn path_input_resolves_relative_to_importer() {
        let dir = std::env::temp_dir().join("aria_module_test_path");
        let _ = fs::create_dir_all(dir.join("sub"));
        let file = dir.join("sub").join("util.aria");
        fs::write(&file, "var x = 1;").unwrap();
        let resolved = resolve_module_path("sub/util.aria", &dir).unwrap();
        assert_eq!(resolved, file.canonicalize().unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_directory_of_relative_path_is_absolute() {
        let dir = file_directory("some_file.aria");
        assert!(dir.is_absolute());
    }
}
