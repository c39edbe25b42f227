//! Script sources and their parsed, immutable form.
//!
//! A script is plain UTF-8 text split into up to three sections by the literal
//! markers `@init\n`, `@block\n` and `@sample\n`. The init and block sections
//! are optional; the sample section is required as soon as any marker is
//! present. A script without any markers is treated as a bare sample section.

use crate::error::ScriptError;

const INIT_MARKER: &str = "@init\n";
const BLOCK_MARKER: &str = "@block\n";
const SAMPLE_MARKER: &str = "@sample\n";

/// The three section bodies of a script, with the markers stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSections {
    pub init: Option<String>,
    pub block: Option<String>,
    pub sample: String,
}

impl ScriptSections {
    /// Split `source` on the section markers. Marker order is validated before
    /// any section is extracted so a malformed script never produces a partial
    /// result.
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let pos_init = source.find(INIT_MARKER);
        let pos_block = source.find(BLOCK_MARKER);
        let pos_sample = source.find(SAMPLE_MARKER);

        // No markers at all: the whole text is the sample section
        if pos_init.is_none() && pos_block.is_none() && pos_sample.is_none() {
            return Ok(Self {
                init: None,
                block: None,
                sample: source.to_owned(),
            });
        }

        let pos_sample = pos_sample.ok_or(ScriptError::MissingSampleSection)?;

        let mut last_pos = 0;
        if let Some(pos) = pos_init {
            last_pos = pos;
        }
        if let Some(pos) = pos_block {
            if pos < last_pos {
                return Err(ScriptError::SectionOrder);
            }
            last_pos = pos;
        }
        if pos_sample < last_pos {
            return Err(ScriptError::SectionOrder);
        }

        let init = pos_init.map(|pos| {
            let start = pos + INIT_MARKER.len();
            let end = pos_block.unwrap_or(pos_sample);
            source[start..end].to_owned()
        });
        let block = pos_block.map(|pos| {
            let start = pos + BLOCK_MARKER.len();
            source[start..pos_sample].to_owned()
        });
        let sample = source[pos_sample + SAMPLE_MARKER.len()..].to_owned();

        Ok(Self {
            init,
            block,
            sample,
        })
    }
}

/// A parsed script plus its ordered parameter-name table. Immutable once
/// published to the registry; shared with in-flight pipelines through an
/// `Arc`. Pipelines only ever create their clones on the real-time thread (a
/// reference count bump) and drop them in non-real-time stages, so the final
/// deallocation never happens on the audio thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRecord {
    sections: ScriptSections,
    parameters: Vec<String>,
}

impl ScriptRecord {
    /// Parse `source` and attach the client-supplied parameter-name table.
    pub fn parse(source: &str, parameters: Vec<String>) -> Result<Self, ScriptError> {
        Ok(Self {
            sections: ScriptSections::parse(source)?,
            parameters,
        })
    }

    pub fn sections(&self) -> &ScriptSections {
        &self.sections
    }

    /// The ordered parameter-name table. Units reference parameters by their
    /// position in this table.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Resolve a parameter table index to its name.
    pub fn parameter_name(&self, index: usize) -> Option<&str> {
        self.parameters.get(index).map(String::as_str)
    }
}
