//! Query parameters and answers.

use crate::error::{ContextError, Result};
use std::fmt;

/// Longest presentation-format name accepted, excluding the trailing dot.
const MAX_NAME_LEN: usize = 253;

/// Longest single label.
const MAX_LABEL_LEN: usize = 63;

/// A DNS record type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::A => f.write_str("A"),
            Self::NS => f.write_str("NS"),
            Self::CNAME => f.write_str("CNAME"),
            Self::SOA => f.write_str("SOA"),
            Self::PTR => f.write_str("PTR"),
            Self::MX => f.write_str("MX"),
            Self::TXT => f.write_str("TXT"),
            Self::AAAA => f.write_str("AAAA"),
            Self::SRV => f.write_str("SRV"),
            Self(other) => write!(f, "TYPE{other}"),
        }
    }
}

/// A DNS class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordClass(pub u16);

impl RecordClass {
    pub const IN: Self = Self(1);
    pub const CH: Self = Self(3);
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self::CH => f.write_str("CH"),
            Self(other) => write!(f, "CLASS{other}"),
        }
    }
}

/// A validated `(name, type, class)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    name: String,
    rtype: RecordType,
    class: RecordClass,
}

impl Query {
    /// Validates and builds a query.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Syntax`] if the name is empty, too long, has
    /// an empty or over-long label, or if type or class is zero.
    pub fn new(name: &str, rtype: RecordType, class: RecordClass) -> Result<Self> {
        check_name(name)?;
        if rtype.0 == 0 {
            return Err(ContextError::Syntax("query type 0 is reserved".into()));
        }
        if class.0 == 0 {
            return Err(ContextError::Syntax("query class 0 is reserved".into()));
        }
        Ok(Self {
            name: name.to_string(),
            rtype,
            class,
        })
    }

    /// Query name as given by the caller.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn rtype(&self) -> RecordType {
        self.rtype
    }

    #[must_use]
    pub const fn class(&self) -> RecordClass {
        self.class
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.class, self.rtype)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ContextError::Syntax("empty query name".into()));
    }
    if name == "." {
        return Ok(());
    }
    let body = name.strip_suffix('.').unwrap_or(name);
    if body.len() > MAX_NAME_LEN {
        return Err(ContextError::Syntax(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    for label in body.split('.') {
        if label.is_empty() {
            return Err(ContextError::Syntax(format!("empty label in {name:?}")));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ContextError::Syntax(format!(
                "label longer than {MAX_LABEL_LEN} bytes in {name:?}"
            )));
        }
    }
    Ok(())
}

/// The outcome of one resolution, handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Answer {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Rdata of each answer record, in wire format.
    pub data: Vec<Vec<u8>>,
    /// Canonical name if the answer followed a CNAME chain.
    pub canonname: Option<String>,
    pub rcode: u16,
    /// `true` if `data` is non-empty.
    pub havedata: bool,
    pub nxdomain: bool,
    /// The answer validated as secure.
    pub secure: bool,
    /// Validation failed; see `why_bogus`.
    pub bogus: bool,
    pub why_bogus: Option<String>,
    pub ttl: u32,
}

impl Answer {
    /// Creates an empty `NOERROR` answer echoing the query.
    #[must_use]
    pub fn for_query(query: &Query) -> Self {
        Self {
            qname: query.name().to_string(),
            qtype: query.rtype().0,
            qclass: query.class().0,
            ..Self::default()
        }
    }

    /// Appends one rdata and marks the answer as having data.
    #[must_use]
    pub fn with_data(mut self, rdata: impl Into<Vec<u8>>) -> Self {
        self.data.push(rdata.into());
        self.havedata = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        for name in ["example.test", "example.test.", ".", "a.b.c.d"] {
            Query::new(name, RecordType::A, RecordClass::IN).unwrap();
        }
    }

    #[test]
    fn rejects_malformed_names() {
        let long_label = "x".repeat(64);
        let long_name = ["abcdefgh"; 30].join(".");
        for name in ["", "a..b", ".leading", long_label.as_str(), long_name.as_str()] {
            let err = Query::new(name, RecordType::A, RecordClass::IN).unwrap_err();
            assert!(matches!(err, ContextError::Syntax(_)), "{name:?}");
        }
    }

    #[test]
    fn rejects_zero_type_and_class() {
        assert!(Query::new("a.test", RecordType(0), RecordClass::IN).is_err());
        assert!(Query::new("a.test", RecordType::A, RecordClass(0)).is_err());
    }

    #[test]
    fn display_uses_mnemonics() {
        let q = Query::new("example.test", RecordType::AAAA, RecordClass::IN).unwrap();
        assert_eq!(q.to_string(), "example.test IN AAAA");
        assert_eq!(RecordType(999).to_string(), "TYPE999");
    }

    #[test]
    fn answer_for_query_echoes_question() {
        let q = Query::new("example.test", RecordType::A, RecordClass::IN).unwrap();
        let a = Answer::for_query(&q).with_data([127, 0, 0, 1]);
        assert_eq!(a.qname, "example.test");
        assert_eq!(a.qtype, 1);
        assert!(a.havedata);
        assert_eq!(a.data, vec![vec![127, 0, 0, 1]]);
    }
}
