//! Command templates and the PV → command map.
//!
//! A template is the instrument command associated with a PV, written once in
//! the declaration table. Two forms exist:
//!
//! - **Queryable**: `C<n>:VOLT_DIV`. Read with `C1:VOLT_DIV?`, written with
//!   `C1:VOLT_DIV <value>`. `<n>` is replaced by the PV's channel index;
//!   lowercase letters outside the placeholder are annotations and are
//!   removed when the template is parsed.
//! - **Special**: anything starting with `!`, e.g.
//!   `!VBS? return=app.Acquisition.Trigger.Type`. These cannot be read back
//!   with `<command>?` and never enter the [`CommandMap`]; their setters use
//!   the raw text.

use crate::error::{AppResult, DaqError};
use crate::pv::{PvDecl, SetterKind};
use std::collections::HashMap;
use tracing::debug;

/// Channel placeholder token in templates.
pub const CHANNEL_PLACEHOLDER: &str = "<n>";

/// Marker prefix of non-queryable templates.
pub const SPECIAL_MARKER: char = '!';

const VBS_QUERY_PREFIX: &str = "VBS? return=";

// Stands in for the placeholder while annotations are stripped.
const PLACEHOLDER_SLOT: char = '\u{0}';

/// A validated instrument command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTemplate {
    /// Readable with `<command>?`, writable with `<command> <value>`.
    Queryable {
        /// Normalized body; the channel slot is kept as a private marker.
        body: String,
    },
    /// Non-queryable form, kept verbatim without the leading marker.
    Special {
        /// Raw text after the marker.
        raw: String,
    },
}

impl CommandTemplate {
    /// Parse and validate a template.
    pub fn parse(template: &str) -> AppResult<Self> {
        let invalid = |reason: &str| DaqError::Template {
            pv: String::new(),
            reason: format!("{} in '{}'", reason, template),
        };

        if let Some(raw) = template.strip_prefix(SPECIAL_MARKER) {
            if raw.trim().is_empty() {
                return Err(invalid("empty special template"));
            }
            return Ok(CommandTemplate::Special {
                raw: raw.to_string(),
            });
        }

        let slotted = template.replace(CHANNEL_PLACEHOLDER, &PLACEHOLDER_SLOT.to_string());
        if slotted.contains('<') || slotted.contains('>') {
            return Err(invalid("unknown placeholder"));
        }
        let body: String = slotted.chars().filter(|c| !c.is_lowercase()).collect();
        if body.replace(PLACEHOLDER_SLOT, "").trim().is_empty() {
            return Err(invalid("empty command"));
        }
        if body.starts_with(SPECIAL_MARKER) {
            return Err(invalid("marker after annotations"));
        }
        Ok(CommandTemplate::Queryable { body })
    }

    /// Shorthand for declaration tables; panics on a malformed literal.
    ///
    /// Only used with the compile-time literals of the declaration table,
    /// which are covered by tests.
    #[allow(clippy::panic)]
    pub fn lit(template: &str) -> Self {
        match Self::parse(template) {
            Ok(parsed) => parsed,
            Err(err) => panic!("{}", err),
        }
    }

    /// Whether the template can be read back with `<command>?`.
    pub fn is_queryable(&self) -> bool {
        matches!(self, CommandTemplate::Queryable { .. })
    }

    /// Command text for `channel`; `None` for special templates.
    pub fn resolve(&self, channel: u8) -> Option<String> {
        match self {
            CommandTemplate::Queryable { body } => {
                Some(body.replace(PLACEHOLDER_SLOT, &channel.to_string()))
            }
            CommandTemplate::Special { .. } => None,
        }
    }

    /// Object path of a `!VBS? return=<path>` template.
    pub fn vbs_path(&self) -> Option<&str> {
        match self {
            CommandTemplate::Special { raw } => raw.strip_prefix(VBS_QUERY_PREFIX).map(str::trim),
            CommandTemplate::Queryable { .. } => None,
        }
    }
}

/// One entry of the command map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    /// PV name.
    pub pv: String,
    /// Channel-resolved command, without `?`.
    pub command: String,
}

impl CommandEntry {
    /// Read query for the entry.
    pub fn query(&self) -> String {
        format!("{}?", self.command)
    }
}

/// PV name → command lookup, built once from the declaration table.
///
/// Entries keep declaration order so settings synchronization walks PVs in
/// a stable order.
#[derive(Debug, Default, Clone)]
pub struct CommandMap {
    entries: Vec<CommandEntry>,
    index: HashMap<String, usize>,
    templates: HashMap<String, CommandTemplate>,
    setters: HashMap<String, SetterKind>,
}

impl CommandMap {
    /// Build the map from the declaration set. No instrument I/O.
    pub fn build(decls: &[PvDecl]) -> Self {
        let mut map = CommandMap::default();
        for decl in decls {
            if let Some(setter) = decl.setter {
                map.setters.insert(decl.name.clone(), setter);
            }
            let Some(template) = &decl.command else {
                continue;
            };
            map.templates.insert(decl.name.clone(), template.clone());
            let channel = decl.channel().unwrap_or(1);
            if let Some(command) = template.resolve(channel) {
                map.index.insert(decl.name.clone(), map.entries.len());
                map.entries.push(CommandEntry {
                    pv: decl.name.clone(),
                    command,
                });
            }
        }
        debug!(
            entries = map.entries.len(),
            setters = map.setters.len(),
            "Command map created"
        );
        map
    }

    /// Queryable entries in declaration order.
    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }

    /// Resolved command of a queryable PV.
    pub fn command(&self, pv: &str) -> Option<&str> {
        self.index.get(pv).map(|&i| self.entries[i].command.as_str())
    }

    /// Template of any PV that declares one, special forms included.
    pub fn template(&self, pv: &str) -> Option<&CommandTemplate> {
        self.templates.get(pv)
    }

    /// Setter of a PV.
    pub fn setter(&self, pv: &str) -> Option<SetterKind> {
        self.setters.get(pv).copied()
    }

    /// Number of queryable entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no queryable entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
