//! Multi-section script splitting.
//!
//! A batch or segment script is a sequence of sections, each introduced
//! by a header line:
//!
//! ```text
//! @segment high_value ttl=60000 refresh=30000
//!     price gt 100
//! @histogram spend bucket=10
//!     return sum price
//! @use high_value
//! ```
//!
//! Everything between one header and the next belongs to the section's
//! code block. Flags are bare words (`on_insert`) or `key=value` pairs.

use std::collections::HashMap;

/// One extracted script section.
#[derive(Debug, Clone, Default)]
pub struct SectionDefinition {
    /// Section type: `segment`, `column`, `histogram`, or `use`.
    pub section_type: String,
    /// Section name (segment name, column name, histogram group).
    pub section_name: String,
    /// Header flags: bare words map to `"true"`.
    pub flags: HashMap<String, String>,
    /// De-indented code block.
    pub code: String,
}

impl SectionDefinition {
    /// Flag value parsed as i64, if present and numeric.
    pub fn flag_i64(&self, name: &str) -> Option<i64> {
        self.flags.get(name).and_then(|v| v.parse::<i64>().ok())
    }

    /// True when the bare flag is present.
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }
}

/// Split a script into its `@` sections. Text before the first header is
/// ignored; a script with no headers yields an empty list.
pub fn extract_sections(source: &str) -> Vec<SectionDefinition> {
    let mut out: Vec<SectionDefinition> = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix('@') {
            let mut words = header.split_whitespace();
            let section_type = words.next().unwrap_or_default().to_string();
            let section_name = words.next().unwrap_or_default().to_string();
            let mut flags = HashMap::new();
            for word in words {
                match word.split_once('=') {
                    Some((k, v)) => flags.insert(k.to_string(), v.to_string()),
                    None => flags.insert(word.to_string(), "true".to_string()),
                };
            }
            out.push(SectionDefinition {
                section_type,
                section_name,
                flags,
                code: String::new(),
            });
        } else if let Some(current) = out.last_mut() {
            current.code.push_str(trimmed);
            current.code.push('\n');
        }
    }
    out
}
