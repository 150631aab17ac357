//! Root hints and the root referral built from them.
//!
//! Names outside the configured zone are answered with a referral to the
//! global root servers, read from a BIND `named.root` file. NS records form
//! the authority section, A/AAAA records the additional section.

use std::path::Path;

use hickory_proto::rr::{Name, Record, RecordSet, RecordType};
use hickory_proto::serialize::txt::Parser;
use tracing::{debug, warn};

use crate::error::BinderError;

const EMBEDDED_HINTS: &str = include_str!("../etc/named.root");

/// Parsed root hints.
#[derive(Debug, Clone, Default)]
pub struct RootHints {
    authorities: Vec<Record>,
    additionals: Vec<Record>,
}

impl RootHints {
    /// Hints compiled into the binary.
    pub fn embedded() -> Result<Self, BinderError> {
        Self::parse(EMBEDDED_HINTS)
    }

    /// Load hints from `path`, or the embedded copy if `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, BinderError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let hints = Self::parse(&text)?;
                debug!(path = %path.display(), servers = hints.authorities.len(), "loaded root hints");
                Ok(hints)
            }
            None => Self::embedded(),
        }
    }

    /// Parse a BIND master file holding the root zone's NS and glue records.
    pub fn parse(text: &str) -> Result<Self, BinderError> {
        let (_origin, zone) = Parser::new(text, None, Some(Name::root()))
            .parse()
            .map_err(|e| BinderError::Config(format!("failed to read root hints: {e}")))?;

        let mut hints = Self::default();
        for record in zone.values().flat_map(RecordSet::records_without_rrsigs) {
            match record.record_type() {
                RecordType::NS => hints.authorities.push(record.clone()),
                RecordType::A | RecordType::AAAA => hints.additionals.push(record.clone()),
                other => warn!(name = %record.name(), rtype = %other, "ignoring root hint"),
            }
        }

        if hints.authorities.is_empty() {
            return Err(BinderError::Config("root hints contain no NS records".into()));
        }
        Ok(hints)
    }

    /// NS records for the root zone.
    pub fn authorities(&self) -> &[Record] {
        &self.authorities
    }

    /// Addresses of the root servers.
    pub fn additionals(&self) -> &[Record] {
        &self.additionals
    }

    /// Number of root servers named.
    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    /// True if no root servers are known.
    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    /// Addresses of one record type in the additional section.
    pub fn addresses(&self, rtype: RecordType) -> usize {
        self.additionals
            .iter()
            .filter(|r| r.record_type() == rtype)
            .count()
    }
}
