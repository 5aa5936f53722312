//! Whole-file unified diff application.
//!
//! Used when committing through a contents API that takes complete file
//! bodies. This is a pure string transform, distinct from the executor's
//! shell-level `patch` run against a working tree.
//!
//! The engine never returns a partially patched body: either every hunk
//! applies and the full new text is returned, or the call fails.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::PatchError;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
        .expect("hunk header pattern is a valid regex")
});

/// Parsed `@@ -old_start[,old_len] +new_start[,new_len] @@` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
}

impl HunkHeader {
    pub fn parse(line: &str) -> Option<Self> {
        let caps = HUNK_HEADER.captures(line)?;
        let num = |i: usize, default: usize| -> Option<usize> {
            match caps.get(i) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(default),
            }
        };
        Some(Self {
            old_start: num(1, 0)?,
            old_len: num(2, 1)?,
            new_start: num(3, 0)?,
            new_len: num(4, 1)?,
        })
    }
}

/// Apply `diff` to `original`, returning the complete patched text.
///
/// Context and deletion lines must match the original exactly; a mismatch
/// means the diff was produced against different content and is reported as
/// `ContextMismatch` rather than silently producing a wrong file.
pub fn apply(original: &str, diff: &str) -> Result<String, PatchError> {
    let source: Vec<&str> = original.split('\n').collect();
    let patch: Vec<&str> = diff.split('\n').collect();

    let mut i = patch
        .iter()
        .position(|line| line.starts_with("@@"))
        .ok_or(PatchError::MissingHunkHeader)?;

    let mut cursor = 0usize;
    let mut result: Vec<&str> = Vec::with_capacity(source.len());

    while i < patch.len() {
        let header_line = i + 1;
        let header = HunkHeader::parse(patch[i]).ok_or_else(|| PatchError::MalformedHunkHeader {
            line: header_line,
            header: patch[i].to_string(),
        })?;
        i += 1;

        // `-0,0` (new file) anchors before the first line.
        let start = header.old_start.saturating_sub(1);
        if start < cursor {
            return Err(PatchError::OverlappingHunk {
                line: header_line,
                start: header.old_start,
                cursor,
            });
        }
        if start > source.len() {
            return Err(PatchError::OutOfRange {
                line: header_line,
                len: source.len(),
            });
        }
        result.extend_from_slice(&source[cursor..start]);
        cursor = start;

        while i < patch.len() && !patch[i].starts_with("@@") {
            let line = patch[i];
            let diff_line = i + 1;
            i += 1;

            let Some(mark) = line.chars().next() else {
                continue;
            };
            let text = &line[mark.len_utf8()..];
            match mark {
                ' ' | '-' => {
                    let found = *source.get(cursor).ok_or(PatchError::OutOfRange {
                        line: diff_line,
                        len: source.len(),
                    })?;
                    if found.trim_end_matches('\r') != text.trim_end_matches('\r') {
                        return Err(PatchError::ContextMismatch {
                            line: diff_line,
                            original_line: cursor + 1,
                            expected: text.to_string(),
                            found: found.to_string(),
                        });
                    }
                    if mark == ' ' {
                        result.push(found);
                    }
                    cursor += 1;
                }
                '+' => result.push(text),
                // "\ No newline at end of file" and stray lines
                _ => {}
            }
        }
    }

    result.extend_from_slice(&source[cursor..]);
    Ok(result.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGE_JSON: &str = "{\n  \"name\": \"app\",\n  \"scripts\": {\n    \"build\": \"tsc\"\n  }\n}\n";

    #[test]
    fn test_parse_hunk_header_with_and_without_lengths() {
        assert_eq!(
            HunkHeader::parse("@@ -3,4 +3,5 @@ fn main()"),
            Some(HunkHeader { old_start: 3, old_len: 4, new_start: 3, new_len: 5 })
        );
        assert_eq!(
            HunkHeader::parse("@@ -7 +7 @@"),
            Some(HunkHeader { old_start: 7, old_len: 1, new_start: 7, new_len: 1 })
        );
        assert_eq!(HunkHeader::parse("@@ garbage @@"), None);
    }

    #[test]
    fn test_apply_single_hunk_addition() {
        let diff = "--- a/package.json\n+++ b/package.json\n@@ -3,3 +3,4 @@\n   \"scripts\": {\n+    \"lint\": \"eslint .\",\n     \"build\": \"tsc\"\n   }\n";
        let patched = apply(PACKAGE_JSON, diff).unwrap();
        assert_eq!(
            patched,
            "{\n  \"name\": \"app\",\n  \"scripts\": {\n    \"lint\": \"eslint .\",\n    \"build\": \"tsc\"\n  }\n}\n"
        );
    }

    #[test]
    fn test_apply_multiple_hunks_with_deletion() {
        let original = "a\nb\nc\nd\ne\nf\ng\n";
        let diff = "@@ -1,2 +1,2 @@\n-a\n+A\n b\n@@ -5,3 +5,2 @@\n e\n-f\n g\n";
        assert_eq!(apply(original, diff).unwrap(), "A\nb\nc\nd\ne\ng\n");
    }

    #[test]
    fn test_apply_creates_new_file_from_empty_original() {
        let diff = "--- /dev/null\n+++ b/NOTES.md\n@@ -0,0 +1,2 @@\n+# Notes\n+hello\n";
        assert_eq!(apply("", diff).unwrap(), "# Notes\nhello\n");
    }

    #[test]
    fn test_apply_ignores_no_newline_marker() {
        let diff = "@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file";
        assert_eq!(apply("old", diff).unwrap(), "new");
    }

    #[test]
    fn test_apply_is_deterministic() {
        let diff = "@@ -1,2 +1,3 @@\n a\n+x\n b\n";
        let first = apply("a\nb\n", diff).unwrap();
        let second = apply("a\nb\n", diff).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_hunk_header_is_rejected() {
        let err = apply(PACKAGE_JSON, "--- a/x\n+++ b/x\n+oops\n").unwrap_err();
        assert_eq!(err, PatchError::MissingHunkHeader);
    }

    #[test]
    fn test_malformed_hunk_header_is_rejected() {
        let err = apply(PACKAGE_JSON, "@@ -a,b +c,d @@\n+x\n").unwrap_err();
        assert!(matches!(err, PatchError::MalformedHunkHeader { line: 1, .. }));
    }

    #[test]
    fn test_context_mismatch_fails_entirely() {
        let err = apply("one\ntwo\n", "@@ -1,2 +1,2 @@\n one\n-three\n+four\n").unwrap_err();
        assert!(matches!(
            err,
            PatchError::ContextMismatch { original_line: 2, .. }
        ));
    }

    #[test]
    fn test_hunk_past_end_is_rejected() {
        let err = apply("one\n", "@@ -9,1 +9,1 @@\n-x\n+y\n").unwrap_err();
        assert!(matches!(err, PatchError::OutOfRange { .. }));
    }

    #[test]
    fn test_overlapping_hunks_are_rejected() {
        let diff = "@@ -2,1 +2,1 @@\n-b\n+B\n@@ -1,1 +1,1 @@\n-a\n+A\n";
        let err = apply("a\nb\nc\n", diff).unwrap_err();
        assert!(matches!(err, PatchError::OverlappingHunk { .. }));
    }

    #[test]
    fn test_crlf_context_lines_match() {
        let diff = "@@ -1,2 +1,2 @@\n a\r\n-b\r\n+c\r\n";
        assert_eq!(apply("a\r\nb\r\n", diff).unwrap(), "a\r\nc\r\n");
    }
}
