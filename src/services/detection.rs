use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::fs;
use std::sync::LazyLock;
use walkdir::WalkDir;

/// Matches `find_package(Qt6 ...)`, `find_package(Qt ...)` and imported targets
/// such as `Qt6::Widgets`.
static TOOL_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)find_package\s*\(\s*Qt[56]?\b|\bQt[56]?::").expect("valid regex")
});

/// Directories never searched for list files.
const SKIPPED_DIRS: &[&str] = &[".git", ".vs", "out", "build"];

pub const LISTS_FILE: &str = "CMakeLists.txt";

/// Whether `path` is a CMake list file (`CMakeLists.txt` or `*.cmake`).
pub fn is_list_file(path: &Utf8Path) -> bool {
    match path.file_name() {
        Some(name) if name.eq_ignore_ascii_case(LISTS_FILE) => true,
        _ => path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("cmake")),
    }
}

/// All list files below `folder`, sorted.
///
/// Unreadable directory entries are logged and skipped.
pub fn list_files(folder: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut files: Vec<Utf8PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping unreadable entry under {}: {}", folder, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.into_path()).ok())
        .filter(|path| is_list_file(path))
        .collect();
    files.sort();
    files
}

pub fn contains_tool_reference(text: &str) -> bool {
    TOOL_REFERENCE.is_match(text)
}

/// Whether any of `files` references the tool.
pub fn has_tool_reference(files: &[Utf8PathBuf]) -> bool {
    files.iter().any(|path| match fs::read_to_string(path) {
        Ok(text) => contains_tool_reference(&text),
        Err(e) => {
            tracing::warn!("Cannot read {}: {}", path, e);
            false
        }
    })
}
