//! Project intelligence: grep, symbol lookup, maps and the index summary.
//!
//! `search_project` prefers ripgrep when it is installed and falls back to
//! an in-process scan. Both paths walk the tree with the `ignore` crate
//! (the same walker family ripgrep uses): gitignore-aware, hidden entries
//! skipped, with override globs for the vendor/build trees that gitignore
//! rules usually miss. The fallback additionally skips large files and
//! binaries.

use std::path::Path;

use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use regex_lite::Regex;

pub const MAX_RESULTS: usize = 50;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
const BINARY_SNIFF_BYTES: usize = 1024;

/// Vendor and build-output trees excluded even outside a git checkout.
const EXCLUDED_GLOBS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
];

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "kt", "scala", "sh", "toml", "json", "yaml", "yml", "md",
];

/// Gitignore-aware walker over `root`. Hidden entries are skipped by the
/// walker's standard filters; the override globs exclude the heavy
/// directories at any depth.
fn project_walk(root: &Path, sorted: bool) -> ignore::Walk {
    let mut builder = WalkBuilder::new(root);
    builder.follow_links(false);
    if sorted {
        builder.sort_by_file_name(std::ffi::OsStr::cmp);
    }
    let mut overrides = OverrideBuilder::new(root);
    for glob in EXCLUDED_GLOBS {
        // The `!` prefix is used to indicate an exclude pattern.
        let _ = overrides.add(&format!("!**/{glob}"));
    }
    if let Ok(matcher) = overrides.build() {
        builder.overrides(matcher);
    }
    builder.build()
}

fn walk_files(root: &Path, sorted: bool) -> impl Iterator<Item = ignore::DirEntry> {
    project_walk(root, sorted)
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
}

fn looks_binary(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return true;
    };
    use std::io::Read;
    let mut buf = [0u8; BINARY_SNIFF_BYTES];
    let Ok(n) = file.read(&mut buf) else {
        return true;
    };
    buf[..n].contains(&0)
}

/// Case-insensitive project grep. `pattern` is tried as a regex first and
/// downgraded to a literal substring when it does not compile.
pub fn search_project(root: &Path, pattern: &str) -> String {
    if let Some(output) = ripgrep_search(root, pattern) {
        return output;
    }
    scan_search(root, pattern)
}

fn ripgrep_search(root: &Path, pattern: &str) -> Option<String> {
    let output = std::process::Command::new("rg")
        .arg("--line-number")
        .arg("--no-heading")
        .arg("--ignore-case")
        .arg("--max-count")
        .arg("10")
        .arg("-e")
        .arg(pattern)
        .arg(".")
        .current_dir(root)
        .output()
        .ok()?;
    // 0 = matches, 1 = clean no-match; anything else means rg choked on the
    // pattern and the fallback scan should decide.
    match output.status.code() {
        Some(0) => {}
        Some(1) => return Some(format!("No matches for `{pattern}`.")),
        _ => return None,
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut lines: Vec<&str> = text.lines().take(MAX_RESULTS + 1).collect();
    let truncated = lines.len() > MAX_RESULTS;
    if truncated {
        lines.truncate(MAX_RESULTS);
    }
    let mut out = lines.join("\n");
    if truncated {
        out.push_str("\n… [more matches truncated]");
    }
    Some(out)
}

fn scan_search(root: &Path, pattern: &str) -> String {
    let regex = Regex::new(&format!("(?i){pattern}")).ok();
    let needle = pattern.to_lowercase();
    let mut results: Vec<String> = Vec::new();
    let mut truncated = false;

    'walk: for entry in walk_files(root, false) {
        if entry
            .metadata()
            .map(|m| m.len() > MAX_FILE_BYTES)
            .unwrap_or(true)
        {
            continue;
        }
        if looks_binary(entry.path()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        for (line_no, line) in content.lines().enumerate() {
            let hit = match &regex {
                Some(re) => re.is_match(line),
                None => line.to_lowercase().contains(&needle),
            };
            if !hit {
                continue;
            }
            if results.len() == MAX_RESULTS {
                truncated = true;
                break 'walk;
            }
            results.push(format!("{display}:{}: {}", line_no + 1, line.trim_end()));
        }
    }

    if results.is_empty() {
        return format!("No matches for `{pattern}`.");
    }
    let mut out = results.join("\n");
    if truncated {
        out.push_str("\n… [more matches truncated]");
    }
    out
}

/// Find likely definition sites for a symbol.
pub fn find_symbol(root: &Path, symbol: &str, as_regex: bool) -> String {
    let matcher: Box<dyn Fn(&str) -> bool> = if as_regex {
        match Regex::new(symbol) {
            Ok(re) => Box::new(move |line: &str| re.is_match(line)),
            Err(e) => return format!("invalid symbol regex: {e}"),
        }
    } else {
        let needle = symbol.to_string();
        Box::new(move |line: &str| line.contains(&needle))
    };

    let definition_markers = [
        "fn ", "struct ", "enum ", "trait ", "impl ", "class ", "def ", "function ", "const ",
        "type ", "interface ", "var ", "let ",
    ];

    let mut results = Vec::new();
    for entry in walk_files(root, false) {
        if !has_code_extension(entry.path()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        for (line_no, line) in content.lines().enumerate() {
            if !matcher(line) {
                continue;
            }
            if !definition_markers.iter().any(|m| line.contains(m)) {
                continue;
            }
            results.push(format!("{display}:{}: {}", line_no + 1, line.trim()));
            if results.len() == MAX_RESULTS {
                let mut out = results.join("\n");
                out.push_str("\n… [more matches truncated]");
                return out;
            }
        }
    }

    if results.is_empty() {
        format!("No definitions found for `{symbol}`.")
    } else {
        results.join("\n")
    }
}

fn has_code_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Flat file listing, one relative path per line.
pub fn project_listing(root: &Path, max_entries: usize) -> String {
    let mut lines = Vec::new();
    for entry in walk_files(root, true) {
        let display = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        lines.push(display);
        if lines.len() == max_entries {
            lines.push("… [listing truncated]".to_string());
            break;
        }
    }
    lines.join("\n")
}

/// Listing plus top-level symbols per source file.
pub fn detailed_map(root: &Path, max_entries: usize) -> String {
    let mut out = String::new();
    let mut entries = 0;
    for entry in walk_files(root, true) {
        if !has_code_extension(entry.path()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        out.push_str(&format!("## {display}\n"));
        for line in content.lines() {
            let trimmed = line.trim_start();
            let top_level = trimmed.len() == line.len();
            if top_level && is_symbol_line(trimmed) {
                out.push_str(&format!("  {}\n", trimmed.trim_end()));
            }
        }
        entries += 1;
        if entries == max_entries {
            out.push_str("… [map truncated]\n");
            break;
        }
    }
    out
}

fn is_symbol_line(line: &str) -> bool {
    const STARTERS: &[&str] = &[
        "fn ", "pub fn ", "pub(crate) fn ", "struct ", "pub struct ", "enum ", "pub enum ",
        "trait ", "pub trait ", "impl ", "class ", "def ", "function ", "export ", "const ",
        "pub const ", "type ", "pub type ", "interface ",
    ];
    STARTERS.iter().any(|s| line.starts_with(s))
}

/// Index summary: file and line counts per extension.
pub fn index_project(root: &Path) -> String {
    use std::collections::BTreeMap;

    let mut by_extension: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut total_files = 0usize;

    for entry in walk_files(root, false) {
        if !has_code_extension(entry.path()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let slot = by_extension.entry(ext).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += content.lines().count();
        total_files += 1;
    }

    let mut out = format!("Indexed {total_files} source files.\n");
    for (ext, (files, lines)) in by_extension {
        out.push_str(&format!("  .{ext}: {files} files, {lines} lines\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn seed_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::create_dir_all(dir.path().join("node_modules/junk")).expect("mkdir");
        fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn greet() {\n    println!(\"Hello\");\n}\n",
        )
        .expect("seed");
        fs::write(
            dir.path().join("node_modules/junk/skip.js"),
            "function greet() {}",
        )
        .expect("seed");
        fs::write(dir.path().join("binary.bin"), [0u8, 1, 2, 3]).expect("seed");
        dir
    }

    #[test]
    fn scan_search_skips_heavy_dirs_and_binaries() {
        let dir = seed_project();
        let out = scan_search(dir.path(), "greet");
        assert!(out.contains("src/lib.rs:1"));
        assert!(!out.contains("node_modules"));
    }

    #[test]
    fn scan_search_is_case_insensitive() {
        let dir = seed_project();
        let out = scan_search(dir.path(), "HELLO");
        assert!(out.contains("src/lib.rs:2"));
    }

    #[test]
    fn hidden_entries_are_skipped_by_the_walker() {
        let dir = seed_project();
        fs::create_dir_all(dir.path().join(".cache")).expect("mkdir");
        fs::write(dir.path().join(".cache/note.md"), "greet me").expect("seed");
        let out = scan_search(dir.path(), "greet");
        assert!(!out.contains(".cache"));
    }

    #[test]
    fn find_symbol_reports_definition_lines() {
        let dir = seed_project();
        let out = find_symbol(dir.path(), "greet", false);
        assert!(out.contains("src/lib.rs:1: pub fn greet()"));
    }

    #[test]
    fn listing_ignores_heavy_dirs() {
        let dir = seed_project();
        let out = project_listing(dir.path(), 100);
        assert!(out.contains("src/lib.rs"));
        assert!(!out.contains("node_modules"));
    }

    #[test]
    fn index_counts_source_files() {
        let dir = seed_project();
        let out = index_project(dir.path());
        assert!(out.contains("Indexed 1 source files."));
        assert!(out.contains(".rs: 1 files, 3 lines"));
    }
}
