// SPDX-License-Identifier: BSD-3-Clause

//! Packet filter expressions.
//!
//! A filter is a small AST of `and`/`or`/`not` over layer-tag predicates
//! and port comparisons, interpreted per packet against the parsed header.
//! Filters come from two places: projected from a module's input metadesc
//! (see [`crate::metadesc`]) or parsed from the canonical text form used in
//! the configuration (`"ip and tcp"`, `"not udp or dst port 53"`).
//!
//! `Display` renders the canonical form; parsing the rendered text yields
//! an equivalent filter, which is what module registration relies on to
//! canonicalize filter strings.

use std::fmt;

use crate::error::Error;
use crate::pkt::{ComoType, L3Type, L4Type, LinkType, PktView};

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches every packet.
    All,
    /// Logical negation.
    Not(Box<Filter>),
    /// Both sides must match.
    And(Box<Filter>, Box<Filter>),
    /// Either side may match.
    Or(Box<Filter>, Box<Filter>),
    /// Top-level type equals the given tag.
    Link(ComoType),
    /// L2 tag equals the given link type.
    L2(LinkType),
    /// L3 tag equals the given network type.
    L3(L3Type),
    /// L4 tag equals the given transport type.
    L4(L4Type),
    /// Source or destination port equals the value.
    Port(u16),
    /// Source port equals the value.
    SrcPort(u16),
    /// Destination port equals the value.
    DstPort(u16),
}

impl Filter {
    /// Evaluates the filter against one packet.
    #[must_use]
    pub fn matches(&self, pkt: &PktView<'_>) -> bool {
        match self {
            Filter::All => true,
            Filter::Not(f) => !f.matches(pkt),
            Filter::And(a, b) => a.matches(pkt) && b.matches(pkt),
            Filter::Or(a, b) => a.matches(pkt) || b.matches(pkt),
            Filter::Link(t) => pkt.hdr.ty == *t,
            Filter::L2(t) => pkt.hdr.l2 == *t,
            Filter::L3(t) => pkt.hdr.l3 == *t,
            Filter::L4(t) => pkt.hdr.l4 == *t,
            Filter::Port(p) => pkt.src_port() == Some(*p) || pkt.dst_port() == Some(*p),
            Filter::SrcPort(p) => pkt.src_port() == Some(*p),
            Filter::DstPort(p) => pkt.dst_port() == Some(*p),
        }
    }

    /// Conjunction that drops redundant `all` terms.
    #[must_use]
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::And(Box::new(a), Box::new(b)),
        }
    }

    /// Disjunction; `all` absorbs the other side.
    #[must_use]
    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (a, b) => Filter::Or(Box::new(a), Box::new(b)),
        }
    }

    /// Parses the canonical text form.
    pub fn parse(input: &str) -> Result<Filter, Error> {
        let mut p = Parser::new(input);
        let f = p.expr()?;
        p.expect_end()?;
        Ok(f)
    }

    fn precedence(&self) -> u8 {
        match self {
            Filter::Or(..) => 1,
            Filter::And(..) => 2,
            _ => 3,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        let prec = self.precedence();
        let parens = prec < parent;
        if parens {
            write!(f, "(")?;
        }
        match self {
            Filter::All => write!(f, "all")?,
            Filter::Not(x) => {
                write!(f, "not ")?;
                x.fmt_with(f, 3)?;
            }
            Filter::And(a, b) => {
                a.fmt_with(f, prec)?;
                write!(f, " and ")?;
                b.fmt_with(f, prec + 1)?;
            }
            Filter::Or(a, b) => {
                a.fmt_with(f, prec)?;
                write!(f, " or ")?;
                b.fmt_with(f, prec + 1)?;
            }
            Filter::Link(t) => write!(
                f,
                "{}",
                match t {
                    ComoType::None => "nolink",
                    ComoType::Link => "link",
                    ComoType::Radio => "radio",
                    ComoType::NetFlow => "nf",
                    ComoType::Sflow => "sflow",
                }
            )?,
            Filter::L2(t) => write!(
                f,
                "{}",
                match t {
                    LinkType::None => "nol2",
                    LinkType::Eth => "eth",
                    LinkType::Vlan => "vlan",
                    LinkType::Isl => "isl",
                    LinkType::Hdlc => "hdlc",
                    LinkType::Ieee80211 => "802.11",
                }
            )?,
            Filter::L3(t) => write!(
                f,
                "{}",
                match t {
                    L3Type::None => "nol3",
                    L3Type::Ip => "ip",
                }
            )?,
            Filter::L4(t) => write!(
                f,
                "{}",
                match t {
                    L4Type::None => "nol4",
                    L4Type::Tcp => "tcp",
                    L4Type::Udp => "udp",
                }
            )?,
            Filter::Port(p) => write!(f, "port {p}")?,
            Filter::SrcPort(p) => write!(f, "src port {p}")?,
            Filter::DstPort(p) => write!(f, "dst port {p}")?,
        }
        if parens {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 0)
    }
}

/// Recursive-descent parser over whitespace-separated tokens.
struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::InvalidFilter {
            filter: self.src.to_owned(),
            at: self.pos,
            reason: reason.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.src[self.pos..].starts_with(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek_token(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = &self.src[self.pos..];
        if rest.is_empty() {
            return None;
        }
        if rest.starts_with('(') || rest.starts_with(')') {
            return Some(&rest[..1]);
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .unwrap_or(rest.len());
        Some(&rest[..end])
    }

    fn bump(&mut self, tok: &str) {
        self.skip_ws();
        self.pos += tok.len();
    }

    fn expr(&mut self) -> Result<Filter, Error> {
        let mut lhs = self.term()?;
        while self.peek_token() == Some("or") {
            self.bump("or");
            let rhs = self.term()?;
            lhs = Filter::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Filter, Error> {
        let mut lhs = self.factor()?;
        while self.peek_token() == Some("and") {
            self.bump("and");
            let rhs = self.factor()?;
            lhs = Filter::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Filter, Error> {
        let Some(tok) = self.peek_token() else {
            return Err(self.err("expected a predicate"));
        };
        match tok {
            "not" => {
                self.bump(tok);
                Ok(Filter::Not(Box::new(self.factor()?)))
            }
            "(" => {
                self.bump(tok);
                let inner = self.expr()?;
                if self.peek_token() != Some(")") {
                    return Err(self.err("expected `)`"));
                }
                self.bump(")");
                Ok(inner)
            }
            _ => self.predicate(),
        }
    }

    fn predicate(&mut self) -> Result<Filter, Error> {
        let Some(tok) = self.peek_token() else {
            return Err(self.err("expected a predicate"));
        };
        let f = match tok {
            "all" => Filter::All,
            "link" => Filter::Link(ComoType::Link),
            "radio" => Filter::Link(ComoType::Radio),
            "nf" => Filter::Link(ComoType::NetFlow),
            "sflow" => Filter::Link(ComoType::Sflow),
            "eth" => Filter::L2(LinkType::Eth),
            "vlan" => Filter::L2(LinkType::Vlan),
            "isl" => Filter::L2(LinkType::Isl),
            "hdlc" => Filter::L2(LinkType::Hdlc),
            "802.11" => Filter::L2(LinkType::Ieee80211),
            "ip" => Filter::L3(L3Type::Ip),
            "tcp" => Filter::L4(L4Type::Tcp),
            "udp" => Filter::L4(L4Type::Udp),
            "port" => {
                self.bump(tok);
                return Ok(Filter::Port(self.number()?));
            }
            "src" | "dst" => {
                let dir = tok;
                self.bump(tok);
                if self.peek_token() != Some("port") {
                    return Err(self.err("expected `port`"));
                }
                self.bump("port");
                let n = self.number()?;
                return Ok(if dir == "src" {
                    Filter::SrcPort(n)
                } else {
                    Filter::DstPort(n)
                });
            }
            other => return Err(self.err(format!("unknown predicate `{other}`"))),
        };
        self.bump(tok);
        Ok(f)
    }

    fn number(&mut self) -> Result<u16, Error> {
        let Some(tok) = self.peek_token() else {
            return Err(self.err("expected a port number"));
        };
        let n: u16 = tok
            .parse()
            .map_err(|_| self.err(format!("`{tok}` is not a port number")))?;
        self.bump(tok);
        Ok(n)
    }

    fn expect_end(&mut self) -> Result<(), Error> {
        match self.peek_token() {
            None => Ok(()),
            Some(tok) => Err(self.err(format!("trailing input at `{tok}`"))),
        }
    }
}
