//! MIME type table
//!
//! Parses the classic `mime.types` format: one type per line followed by
//! its extensions, `#` comments and blank lines ignored. A process-wide
//! singleton is populated at startup and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use tracing::warn;

static GLOBAL: OnceLock<MimeTypes> = OnceLock::new();

/// Extension to MIME type mapping.
#[derive(Debug, Clone, Default)]
pub struct MimeTypes {
    entries: Vec<(String, Vec<String>)>,
    by_extension: HashMap<String, String>,
}

impl MimeTypes {
    /// Parses `mime.types` text. Later lines never shadow an extension
    /// already claimed by an earlier one.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(mime_type) = fields.next() else {
                continue;
            };
            let extensions: Vec<String> = fields.map(|ext| ext.to_ascii_lowercase()).collect();
            for ext in &extensions {
                table
                    .by_extension
                    .entry(ext.clone())
                    .or_insert_with(|| mime_type.to_string());
            }
            table.entries.push((mime_type.to_string(), extensions));
        }
        table
    }

    /// Loads and parses a `mime.types` file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// A small built-in table used when no file is available.
    pub fn builtin() -> Self {
        Self::parse(
            "text/html html htm\n\
             text/plain txt\n\
             text/css css\n\
             text/javascript js\n\
             application/json json\n\
             application/octet-stream bin\n\
             image/png png\n\
             image/jpeg jpg jpeg\n\
             image/gif gif\n",
        )
    }

    /// Looks up the type registered for an extension.
    pub fn lookup(&self, extension: &str) -> Option<&str> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Looks up the type for a path by its extension.
    pub fn for_path(&self, path: &Path) -> Option<&str> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.lookup(ext))
    }

    /// Serializes back into `mime.types` format. Parsing the output yields
    /// the same extension to type mapping.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (mime_type, extensions) in &self.entries {
            out.push_str(mime_type);
            for ext in extensions {
                out.push(' ');
                out.push_str(ext);
            }
            out.push('\n');
        }
        out
    }

    /// The extension to type mapping, for comparisons.
    pub fn mapping(&self) -> &HashMap<String, String> {
        &self.by_extension
    }

    /// Installs `table` as the process-wide singleton. Returns false when a
    /// table was already installed, in which case the existing one stays.
    pub fn install_global(table: MimeTypes) -> bool {
        GLOBAL.set(table).is_ok()
    }

    /// The process-wide table, falling back to the built-in one when
    /// nothing was installed.
    pub fn global() -> &'static MimeTypes {
        GLOBAL.get_or_init(|| {
            warn!("mime table not initialized, using built-in defaults");
            Self::builtin()
        })
    }
}
