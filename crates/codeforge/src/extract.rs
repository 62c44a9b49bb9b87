//! Extraction of file blocks from builder output.
//!
//! The builder emits fenced code blocks whose first inside line is a
//! `// filepath: <path>` marker; the remaining block body is the file
//! content. Anything outside such blocks (prose, unmarked fences) is
//! ignored for materialization.

use std::sync::LazyLock;

use regex::Regex;

/// Fence with optional language tag, a filepath marker line, then the body.
static FILE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_.+#-]*\r?\n//\s*filepath:[ \t]*([^\r\n]+)\r?\n(.*?)```")
        .expect("file block regex is valid")
});

/// One file parsed out of builder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: String,
    pub content: String,
}

/// Scan builder output for `// filepath:` blocks, in order of appearance.
pub fn extract_file_blocks(text: &str) -> Vec<ExtractedFile> {
    FILE_BLOCK
        .captures_iter(text)
        .map(|cap| ExtractedFile {
            path: cap[1].trim().to_string(),
            content: cap[2].to_string(),
        })
        .collect()
}
