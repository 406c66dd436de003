//! Source pre-checks. Pure functions: no filesystem access, no processes.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("LaTeX content is empty")]
    Empty,
    #[error("Missing \\documentclass declaration")]
    MissingDocumentClass,
    #[error("Missing \\begin{{document}}")]
    MissingBeginDocument,
    #[error("Missing \\end{{document}}")]
    MissingEndDocument,
    #[error("Unbalanced braces in LaTeX content")]
    UnbalancedBraces { open: usize, close: usize },
}

const DOCUMENT_CLASS: &str = "\\documentclass";
const BEGIN_DOCUMENT: &str = "\\begin{document}";
const END_DOCUMENT: &str = "\\end{document}";

pub const DEFAULT_BASE_FILENAME: &str = "document";

/// Structural checks run before any workspace is created.
///
/// Braces are compared by raw count, so escaped `\{` still counts.
pub fn validate_source(source: &str) -> Result<(), ValidationError> {
    if source.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if !source.contains(DOCUMENT_CLASS) {
        return Err(ValidationError::MissingDocumentClass);
    }
    if !source.contains(BEGIN_DOCUMENT) {
        return Err(ValidationError::MissingBeginDocument);
    }
    if !source.contains(END_DOCUMENT) {
        return Err(ValidationError::MissingEndDocument);
    }

    let open = source.matches('{').count();
    let close = source.matches('}').count();
    if open != close {
        return Err(ValidationError::UnbalancedBraces { open, close });
    }

    Ok(())
}

/// Reduce a caller-supplied name to `[A-Za-z0-9_-]` so it is safe as a file
/// name and as a compiler argument.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    if cleaned.is_empty() {
        DEFAULT_BASE_FILENAME.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINIMAL: &str = "\\documentclass{article}\n\\begin{document}\nHello\n\\end{document}\n";

    #[test]
    fn accepts_minimal_document() {
        assert_eq!(validate_source(MINIMAL), Ok(()));
    }

    #[test]
    fn rejects_each_structural_defect() {
        assert_eq!(validate_source("   \n"), Err(ValidationError::Empty));
        assert_eq!(
            validate_source("\\begin{document}x\\end{document}"),
            Err(ValidationError::MissingDocumentClass)
        );
        assert_eq!(
            validate_source("\\documentclass{article}\\end{document}"),
            Err(ValidationError::MissingBeginDocument)
        );
        assert_eq!(
            validate_source("\\documentclass{article}\\begin{document}"),
            Err(ValidationError::MissingEndDocument)
        );
        assert_eq!(
            validate_source("\\documentclass{article}\\begin{document}{\\end{document}"),
            Err(ValidationError::UnbalancedBraces { open: 4, close: 3 })
        );
    }

    #[test]
    fn error_messages_are_user_facing() {
        assert_eq!(ValidationError::MissingBeginDocument.to_string(), "Missing \\begin{document}");
        assert_eq!(
            ValidationError::UnbalancedBraces { open: 1, close: 0 }.to_string(),
            "Unbalanced braces in LaTeX content"
        );
    }

    #[test]
    fn sanitize_strips_path_and_shell_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("my thesis; rm -rf"), "mythesisrm-rf");
        assert_eq!(sanitize_filename("chapter_1-draft"), "chapter_1-draft");
        assert_eq!(sanitize_filename("$()"), DEFAULT_BASE_FILENAME);
    }

    proptest! {
        #[test]
        fn brace_check_matches_raw_counts(body in "[a-z{}\\\\ ]{0,64}") {
            let source = format!("\\documentclass{{article}}\\begin{{document}}{body}\\end{{document}}");
            let open = body.matches('{').count();
            let close = body.matches('}').count();

            let result = validate_source(&source);
            if open == close {
                prop_assert_eq!(result, Ok(()));
            } else {
                prop_assert_eq!(result, Err(ValidationError::UnbalancedBraces { open: open + 3, close: close + 3 }));
            }
        }

        #[test]
        fn sanitized_names_are_never_empty_or_unsafe(name in ".{0,32}") {
            let cleaned = sanitize_filename(&name);
            prop_assert!(!cleaned.is_empty());
            prop_assert!(cleaned.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
    }
}
