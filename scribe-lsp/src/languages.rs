//! Mapping from file names to LSP language ids.
//!
//! The database is a value threaded into the [`crate::Workspace`] rather
//! than process-wide state, so hosts can run differently configured
//! workspaces side by side. The built-in table covers the language ids the
//! protocol specification enumerates.

use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

// (language id, extensions/filenames)
const DEFAULT_LANGUAGES: &[(&str, &[&str])] = &[
    ("abap", &[".abap"]),
    ("bat", &[".bat", ".cmd"]),
    ("bibtex", &[".bib"]),
    ("c", &[".c", ".h"]),
    ("clojure", &[".clj", ".cljs", ".cljc", ".edn"]),
    ("coffeescript", &[".coffee"]),
    ("cpp", &[".cc", ".cpp", ".cxx", ".hh", ".hpp", ".hxx"]),
    ("csharp", &[".cs", ".csx"]),
    ("css", &[".css"]),
    ("dart", &[".dart"]),
    ("diff", &[".diff", ".patch"]),
    ("dockerfile", &["Dockerfile", ".dockerfile"]),
    ("elixir", &[".ex", ".exs"]),
    ("erlang", &[".erl", ".hrl"]),
    ("fsharp", &[".fs", ".fsi", ".fsx"]),
    ("go", &[".go"]),
    ("groovy", &[".groovy", ".gvy"]),
    ("handlebars", &[".hbs", ".handlebars"]),
    ("haskell", &[".hs", ".lhs"]),
    ("html", &[".html", ".htm", ".xhtml"]),
    ("ini", &[".ini", ".cfg"]),
    ("java", &[".java"]),
    ("javascript", &[".js", ".mjs", ".cjs"]),
    ("javascriptreact", &[".jsx"]),
    ("json", &[".json"]),
    ("latex", &[".tex", ".ltx"]),
    ("less", &[".less"]),
    ("lua", &[".lua"]),
    ("makefile", &["Makefile", "makefile", ".mk"]),
    ("markdown", &[".md", ".markdown"]),
    ("objective-c", &[".m"]),
    ("objective-cpp", &[".mm"]),
    ("perl", &[".pl", ".pm", ".t"]),
    ("php", &[".php", ".phtml"]),
    ("powershell", &[".ps1", ".psm1", ".psd1"]),
    ("python", &[".py", ".pyi", ".pyw"]),
    ("r", &[".r", ".R"]),
    ("razor", &[".cshtml", ".razor"]),
    ("ruby", &[".rb", ".erb", ".rake", "Rakefile", "Gemfile"]),
    ("rust", &[".rs"]),
    ("scala", &[".scala", ".sc"]),
    ("scss", &[".scss"]),
    ("shellscript", &[".sh", ".bash", ".zsh"]),
    ("sql", &[".sql"]),
    ("swift", &[".swift"]),
    ("toml", &[".toml"]),
    ("typescript", &[".ts", ".mts", ".cts"]),
    ("typescriptreact", &[".tsx"]),
    ("vb", &[".vb"]),
    ("xml", &[".xml", ".xsd", ".xsl", ".svg"]),
    ("xsl", &[".xslt"]),
    ("yaml", &[".yaml", ".yml"]),
];

/// Maps file extensions (or whole file names such as `Makefile`) to
/// language ids.
#[derive(Debug, Clone)]
pub struct LanguageDatabase {
    extensions: HashMap<String, String>,
}

impl Default for LanguageDatabase {
    fn default() -> Self {
        let mut extensions = HashMap::new();
        for (language_id, patterns) in DEFAULT_LANGUAGES {
            for pattern in *patterns {
                extensions.insert((*pattern).to_owned(), (*language_id).to_owned());
            }
        }
        LanguageDatabase { extensions }
    }
}

impl LanguageDatabase {
    /// A database without any built-in associations.
    pub fn empty() -> LanguageDatabase {
        LanguageDatabase {
            extensions: HashMap::new(),
        }
    }

    /// Associate `extensions` (each either an `.ext` suffix or a full file
    /// name) with `language_id`. Existing associations are only replaced
    /// when `allow_overwrite` is set.
    pub fn install_language(
        &mut self,
        language_id: &str,
        extensions: &[&str],
        allow_overwrite: bool,
    ) -> Result<()> {
        if extensions.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "at least one file extension must be given"
            )));
        }
        if !allow_overwrite {
            for extension in extensions {
                if let Some(existing) = self.extensions.get(*extension) {
                    return Err(Error::Other(anyhow::anyhow!(
                        "file extension {extension} is already associated with language id {existing}"
                    )));
                }
            }
        }
        for extension in extensions {
            self.extensions
                .insert((*extension).to_owned(), language_id.to_owned());
        }
        Ok(())
    }

    /// Guess the language id for a path: the full file name wins, then each
    /// dot-suffix from the left-most dot to the end.
    pub fn language_id_for_path(&self, path: &Path) -> Option<&str> {
        let name = path.file_name()?.to_str()?;

        if let Some(language_id) = self.extensions.get(name) {
            return Some(language_id);
        }

        let mut start = 0;
        while let Some(dot) = name[start..].find('.') {
            start += dot;
            if let Some(language_id) = self.extensions.get(&name[start..]) {
                return Some(language_id);
            }
            start += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn guesses_by_extension_and_file_name() {
        let db = LanguageDatabase::default();
        assert_eq!(db.language_id_for_path(Path::new("/ws/a.py")), Some("python"));
        assert_eq!(db.language_id_for_path(Path::new("lib.rs")), Some("rust"));
        assert_eq!(db.language_id_for_path(Path::new("Makefile")), Some("makefile"));
        assert_eq!(db.language_id_for_path(Path::new("module.test.ts")), Some("typescript"));
        assert_eq!(db.language_id_for_path(Path::new("noext")), None);
    }

    #[test]
    fn install_respects_overwrite_policy() {
        let mut db = LanguageDatabase::default();
        assert!(db.install_language("gleam", &[".gleam"], false).is_ok());
        assert_eq!(db.language_id_for_path(Path::new("a.gleam")), Some("gleam"));

        assert!(db.install_language("notrust", &[".rs"], false).is_err());
        assert!(db.install_language("notrust", &[".rs"], true).is_ok());
        assert_eq!(db.language_id_for_path(Path::new("a.rs")), Some("notrust"));
    }
}
