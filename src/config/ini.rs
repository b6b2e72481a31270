//! INI document parsing and serialization for `bhid.conf`
//!
//! Section names carry connection full-names (`tracker#email/path`).
//! Historical files escaped dots, hashes and semicolons in section headers
//! with a backslash; `parse` unescapes them and reports whether any were
//! seen so the caller can rewrite the file once.

use crate::error::ConfigError;

/// An order-preserving INI document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Result of parsing: the document plus whether legacy escapes were found
#[derive(Debug, Clone)]
pub struct Parsed {
    pub document: IniDocument,
    pub migrated: bool,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse INI text
    pub fn parse(content: &str) -> Result<Parsed, ConfigError> {
        let mut document = IniDocument::new();
        let mut migrated = false;
        let mut current: Option<usize> = None;

        for (line_num, raw) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("Unterminated section header: {}", line),
                    });
                }
                let raw_name = &line[1..line.len() - 1];
                let name = unescape_section(raw_name);
                if name != raw_name {
                    migrated = true;
                }
                current = Some(document.ensure_section(&name));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let Some(idx) = current else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: "Value outside of any section".to_string(),
                });
            };

            document.sections[idx]
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Parsed { document, migrated })
    }

    /// Serialize to normalized INI text
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }

    /// Section names in file order
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    /// Index of the named section, creating it at the end if absent
    fn ensure_section(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(Section {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.sections.len() - 1
    }

    pub fn remove_section(&mut self, name: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.name != name);
        self.sections.len() != before
    }

    /// Last value for a key in a section
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a key, replacing an existing entry in place
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let idx = self.ensure_section(section);
        let entries = &mut self.sections[idx].entries;
        if let Some(entry) = entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.into();
        } else {
            entries.push((key.to_string(), value.into()));
        }
    }

    pub fn unset(&mut self, section: &str, key: &str) {
        if let Some(s) = self.sections.iter_mut().find(|s| s.name == section) {
            s.entries.retain(|(k, _)| k != key);
        }
    }

    /// All entries of a section in file order
    pub fn entries<'a>(&'a self, section: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.sections
            .iter()
            .filter(move |s| s.name == section)
            .flat_map(|s| s.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Strip legacy backslash escapes from a section header
fn unescape_section(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('.' | '#' | ';')) => out.push(next),
                Some(next) => {
                    out.push(c);
                    out.push(next);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[daemon]
name = first
; comment
[tracker.example.com#user@example.com/path]
type = server
connect_address = 127.0.0.1
connect_port = 9001
"#;

    #[test]
    fn test_parse_basic() {
        let parsed = IniDocument::parse(SAMPLE).unwrap();
        assert!(!parsed.migrated);
        let doc = parsed.document;
        assert_eq!(doc.get("daemon", "name"), Some("first"));
        assert_eq!(
            doc.get("tracker.example.com#user@example.com/path", "type"),
            Some("server")
        );
        assert_eq!(
            doc.get("tracker.example.com#user@example.com/path", "connect_port"),
            Some("9001")
        );
    }

    #[test]
    fn test_escape_migration() {
        let content = "[user\\.name\\#1]\nkey = value\n";
        let parsed = IniDocument::parse(content).unwrap();
        assert!(parsed.migrated);
        assert_eq!(parsed.document.get("user.name#1", "key"), Some("value"));

        // Re-serialized form has no escapes and parses clean
        let text = parsed.document.serialize();
        assert!(text.contains("[user.name#1]"));
        let again = IniDocument::parse(&text).unwrap();
        assert!(!again.migrated);
    }

    #[test]
    fn test_serialize_stable() {
        let first = IniDocument::parse(SAMPLE).unwrap().document.serialize();
        let second = IniDocument::parse(&first).unwrap().document.serialize();
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut doc = IniDocument::new();
        doc.set("s", "a", "1");
        doc.set("s", "b", "2");
        doc.set("s", "a", "3");
        assert_eq!(doc.get("s", "a"), Some("3"));
        let text = doc.serialize();
        assert_eq!(text, "[s]\na = 3\nb = 2\n");
    }

    #[test]
    fn test_remove_section() {
        let mut doc = IniDocument::parse(SAMPLE).unwrap().document;
        assert!(doc.remove_section("daemon"));
        assert!(!doc.has_section("daemon"));
        assert!(!doc.remove_section("daemon"));
    }

    #[test]
    fn test_value_outside_section() {
        assert!(IniDocument::parse("key = value\n").is_err());
    }

    #[test]
    fn test_unterminated_header() {
        assert!(IniDocument::parse("[broken\n").is_err());
    }
}
