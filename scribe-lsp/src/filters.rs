//! Evaluation of document selectors and file-operation filters.

use std::path::Path;

use globset::GlobBuilder;

use crate::capabilities::TextDocumentInfo;
use crate::lsp;

fn glob_matches(pattern: &str, case_insensitive: bool, path: &str) -> bool {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build();
    match glob {
        Ok(glob) => glob.compile_matcher().is_match(Path::new(path)),
        Err(err) => {
            log::error!("invalid glob sent by server: {err}");
            false
        }
    }
}

/// Whether a document matches a single [`lsp::DocumentFilter`]. All present
/// members of the filter must match.
pub(crate) fn matches_document_filter(info: &TextDocumentInfo, filter: &lsp::DocumentFilter) -> bool {
    if let Some(scheme) = &filter.scheme {
        if info.uri.scheme() != scheme {
            return false;
        }
    }

    if let Some(language) = &filter.language {
        if &info.language_id != language {
            return false;
        }
    }

    if let Some(pattern) = &filter.pattern {
        if !glob_matches(pattern, false, info.uri.path()) {
            return false;
        }
    }

    true
}

/// Whether a document matches at least one filter of a selector.
pub(crate) fn matches_document_selector(
    info: &TextDocumentInfo,
    selector: &[lsp::DocumentFilter],
) -> bool {
    selector
        .iter()
        .any(|filter| matches_document_filter(info, filter))
}

/// Whether a URI matches a single [`lsp::FileOperationFilter`].
pub(crate) fn matches_file_operation_filter(
    uri: &lsp::Url,
    filter: &lsp::FileOperationFilter,
) -> bool {
    if let Some(scheme) = &filter.scheme {
        if uri.scheme() != scheme {
            return false;
        }
    }

    let pattern = &filter.pattern;
    let ignore_case = pattern
        .options
        .as_ref()
        .and_then(|options| options.ignore_case)
        .unwrap_or(false);
    if !glob_matches(&pattern.glob, ignore_case, uri.path()) {
        return false;
    }

    if let Some(matches) = &pattern.matches {
        let is_directory = uri
            .to_file_path()
            .map(|path| path.is_dir())
            .unwrap_or(false);
        match matches {
            lsp::FileOperationPatternKind::File if is_directory => return false,
            lsp::FileOperationPatternKind::Folder if !is_directory => return false,
            _ => {}
        }
    }

    true
}

pub(crate) fn matches_file_operation_filters(
    uri: &lsp::Url,
    filters: &[lsp::FileOperationFilter],
) -> bool {
    filters
        .iter()
        .any(|filter| matches_file_operation_filter(uri, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uri: &str, language_id: &str) -> TextDocumentInfo {
        TextDocumentInfo {
            uri: lsp::Url::parse(uri).unwrap(),
            language_id: language_id.to_owned(),
        }
    }

    fn filter(
        language: Option<&str>,
        scheme: Option<&str>,
        pattern: Option<&str>,
    ) -> lsp::DocumentFilter {
        lsp::DocumentFilter {
            language: language.map(str::to_owned),
            scheme: scheme.map(str::to_owned),
            pattern: pattern.map(str::to_owned),
        }
    }

    #[test]
    fn language_and_scheme() {
        let doc = info("file:///ws/main.py", "python");
        assert!(matches_document_filter(&doc, &filter(Some("python"), None, None)));
        assert!(!matches_document_filter(&doc, &filter(Some("rust"), None, None)));
        assert!(!matches_document_filter(&doc, &filter(None, Some("untitled"), None)));
    }

    #[test]
    fn glob_patterns_with_selections() {
        let doc = info("file:///ws/src/main.rs", "rust");
        assert!(matches_document_filter(
            &doc,
            &filter(None, None, Some("**/*.{rs,toml}"))
        ));
        assert!(!matches_document_filter(
            &doc,
            &filter(None, None, Some("**/*.{py,pyi}"))
        ));
    }

    #[test]
    fn file_operation_case_folding() {
        let uri = lsp::Url::parse("file:///ws/README.MD").unwrap();
        let pattern = |ignore_case| lsp::FileOperationFilter {
            scheme: Some("file".to_owned()),
            pattern: lsp::FileOperationPattern {
                glob: "**/*.md".to_owned(),
                matches: None,
                options: Some(lsp::FileOperationPatternOptions {
                    ignore_case: Some(ignore_case),
                }),
            },
        };
        assert!(matches_file_operation_filter(&uri, &pattern(true)));
        assert!(!matches_file_operation_filter(&uri, &pattern(false)));
    }
}
