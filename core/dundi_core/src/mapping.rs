//! Context mappings and the dialplan adapter they answer from
//!
//! A mapping ties a DUNDi context to a local dialplan context: when a query
//! for the DUNDi context arrives, the number is checked against the local
//! context and, if it matches, answered with the mapping's technology,
//! weight and destination template.

use std::collections::HashMap;
use std::fmt;

use crate::config::Config;
use crate::eid::Eid;
use crate::request::{DundiResult, HintMetadata};
use crate::wire::{flags, hint};

/// Highest weight a mapping may carry
pub const MAX_WEIGHT: u16 = 59999;

// ============================================================================
// Technology
// ============================================================================

/// Channel technology an answer points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tech {
    None,
    Iax,
    H323,
    Sip,
    Pjsip,
    /// Code we do not know a name for
    Other(u16),
}

impl Tech {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Tech::None,
            1 => Tech::Iax,
            2 => Tech::H323,
            3 => Tech::Sip,
            4 => Tech::Pjsip,
            other => Tech::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Tech::None => 0,
            Tech::Iax => 1,
            Tech::H323 => 2,
            Tech::Sip => 3,
            Tech::Pjsip => 4,
            Tech::Other(code) => code,
        }
    }

    /// Parse a configured technology name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Some(Tech::None),
            "IAX" | "IAX2" => Some(Tech::Iax),
            "H323" => Some(Tech::H323),
            "SIP" => Some(Tech::Sip),
            "PJSIP" => Some(Tech::Pjsip),
            _ => None,
        }
    }
}

impl fmt::Display for Tech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tech::None => write!(f, "None"),
            Tech::Iax => write!(f, "IAX2"),
            Tech::H323 => write!(f, "H323"),
            Tech::Sip => write!(f, "SIP"),
            Tech::Pjsip => write!(f, "PJSIP"),
            Tech::Other(code) => write!(f, "Tech{}", code),
        }
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// One DUNDi context to local context mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub dcontext: String,
    pub lcontext: String,
    pub weight: u16,
    pub tech: Tech,
    /// Destination template, may reference `${NUMBER}`, `${EID}`, `${SECRET}`, `${IPADDR}`
    pub dest: String,
    /// Answer flags added to every answer from this mapping
    pub options: u16,
    /// Suppress CANMATCH/MATCHMORE answers
    pub nopartial: bool,
}

/// Parse one mapping option. Returns `None` for unknown names.
pub fn parse_option(name: &str) -> Option<MappingOption> {
    let opt = match name.trim().to_ascii_lowercase().as_str() {
        "nounsolicited" => MappingOption::Flag(flags::NOUNSOLICITED),
        "nocomunsolicit" => MappingOption::Flag(flags::NOCOMUNSOLICIT),
        "residential" => MappingOption::Flag(flags::RESIDENTIAL),
        "commercial" => MappingOption::Flag(flags::COMMERCIAL),
        "mobile" => MappingOption::Flag(flags::MOBILE),
        "nopartial" => MappingOption::NoPartial,
        _ => return None,
    };
    Some(opt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOption {
    Flag(u16),
    NoPartial,
}

impl Mapping {
    pub fn options_string(&self) -> String {
        let mut out = Vec::new();
        if self.options != 0 {
            out.push(crate::wire::flags_to_string(self.options));
        }
        if self.nopartial {
            out.push("NOPARTIAL".to_string());
        }
        if out.is_empty() {
            "None".to_string()
        } else {
            out.join("|")
        }
    }
}

/// Values available to destination templates
#[derive(Debug, Clone)]
pub struct LocalIdentity<'a> {
    pub us: Eid,
    pub secret: &'a str,
    pub ipaddr: &'a str,
    pub cachetime: u32,
}

/// Expand `${NAME}` references in a destination template
pub fn substitute(template: &str, number: &str, ident: &LocalIdentity<'_>) -> String {
    let eid = ident.us.to_string();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let value = match &after[..end] {
                    "NUMBER" => number,
                    "EID" => eid.as_str(),
                    "SECRET" => ident.secret,
                    "IPADDR" => ident.ipaddr,
                    _ => "",
                };
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Answer `number` from one mapping.
///
/// Matching answers are appended to `results`. When nothing matches, the
/// shortest prefix of `number` that cannot match becomes the hint prefix if
/// it is longer than the one recorded so far.
pub fn lookup_local(
    map: &Mapping,
    dialplan: &dyn Dialplan,
    number: &str,
    ident: &LocalIdentity<'_>,
    results: &mut Vec<DundiResult>,
    hmd: &mut HintMetadata,
) {
    if map.lcontext.is_empty() {
        return;
    }
    let mut found = 0u16;
    if dialplan.exists(&map.lcontext, number) {
        found |= flags::EXISTS;
    }
    if dialplan.can_match(&map.lcontext, number) {
        found |= flags::CANMATCH;
    }
    if dialplan.match_more(&map.lcontext, number) {
        found |= flags::MATCHMORE;
    }
    if dialplan.ignore_pattern(&map.lcontext, number) {
        found |= flags::IGNOREPAT;
    }

    if found != 0 {
        hmd.clear(hint::DONT_ASK);
    }
    if map.nopartial {
        found &= !(flags::MATCHMORE | flags::CANMATCH);
    }

    if found != 0 {
        let dest = if found & flags::EXISTS != 0 {
            substitute(&map.dest, number, ident)
        } else {
            String::new()
        };
        results.push(DundiResult {
            flags: found | map.options,
            weight: map.weight,
            expiration: ident.cachetime,
            tech: map.tech,
            eid: ident.us,
            dest,
        });
    } else {
        for (idx, _) in number.char_indices().skip(1).chain(std::iter::once((number.len(), ' '))) {
            let prefix = &number[..idx];
            if !dialplan.can_match(&map.lcontext, prefix) {
                if prefix.len() > hmd.exten.len() {
                    hmd.exten = prefix.to_string();
                }
                break;
            }
        }
    }
}

// ============================================================================
// Dialplan adapter
// ============================================================================

/// Local number resolution used to answer queries
pub trait Dialplan: Send + Sync {
    /// `number` is a complete extension in `context`
    fn exists(&self, context: &str, number: &str) -> bool;
    /// `number` matches now or could match with more digits
    fn can_match(&self, context: &str, number: &str) -> bool;
    /// More digits could still produce a match
    fn match_more(&self, context: &str, number: &str) -> bool;
    /// `number` falls under an ignore pattern of `context`
    fn ignore_pattern(&self, context: &str, number: &str) -> bool;
    /// Literal extensions of `context`, used to fill the precache queue
    fn extensions(&self, context: &str) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    /// Any character from the set
    Class(Vec<(char, char)>),
    /// Exactly one character of any kind
    Any,
    /// Zero or more characters of any kind
    Star,
}

impl Token {
    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::Class(ranges) => ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi),
            Token::Any | Token::Star => true,
        }
    }
}

/// Compiled extension or `_` pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(source: &str) -> Self {
        let mut tokens = Vec::new();
        match source.strip_prefix('_') {
            None => tokens.extend(source.chars().map(Token::Literal)),
            Some(pat) => {
                let mut chars = pat.chars().peekable();
                while let Some(c) = chars.next() {
                    let token = match c.to_ascii_uppercase() {
                        'X' => Token::Class(vec![('0', '9')]),
                        'Z' => Token::Class(vec![('1', '9')]),
                        'N' => Token::Class(vec![('2', '9')]),
                        '.' => {
                            tokens.push(Token::Any);
                            Token::Star
                        }
                        '!' => Token::Star,
                        '[' => {
                            let mut ranges = Vec::new();
                            let mut prev: Option<char> = None;
                            while let Some(m) = chars.next() {
                                if m == ']' {
                                    break;
                                }
                                if m == '-' {
                                    if let (Some(lo), Some(hi)) = (prev, chars.peek().copied()) {
                                        if hi != ']' {
                                            chars.next();
                                            ranges.pop();
                                            ranges.push((lo, hi));
                                            prev = None;
                                            continue;
                                        }
                                    }
                                }
                                ranges.push((m, m));
                                prev = Some(m);
                            }
                            Token::Class(ranges)
                        }
                        _ => Token::Literal(c),
                    };
                    tokens.push(token);
                }
            }
        }
        Self {
            source: source.to_string(),
            tokens,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        !self.source.starts_with('_')
    }

    /// Add every position reachable without consuming input
    fn closure(&self, states: &mut Vec<usize>) {
        let mut i = 0;
        while i < states.len() {
            let pos = states[i];
            if pos < self.tokens.len() && self.tokens[pos] == Token::Star && !states.contains(&(pos + 1)) {
                states.push(pos + 1);
            }
            i += 1;
        }
    }

    /// Pattern positions reachable after consuming all of `input`
    fn run(&self, input: &str) -> Vec<usize> {
        let mut states = vec![0];
        self.closure(&mut states);
        for c in input.chars() {
            let mut next = Vec::new();
            for &pos in &states {
                if pos >= self.tokens.len() || !self.tokens[pos].accepts(c) {
                    continue;
                }
                let target = if self.tokens[pos] == Token::Star { pos } else { pos + 1 };
                if !next.contains(&target) {
                    next.push(target);
                }
            }
            self.closure(&mut next);
            if next.is_empty() {
                return next;
            }
            states = next;
        }
        states
    }

    pub fn matches(&self, input: &str) -> bool {
        self.run(input).contains(&self.tokens.len())
    }

    pub fn can_match(&self, input: &str) -> bool {
        !self.run(input).is_empty()
    }

    pub fn match_more(&self, input: &str) -> bool {
        self.run(input).iter().any(|&pos| pos < self.tokens.len())
    }
}

#[derive(Debug, Clone, Default)]
struct Context {
    extensions: Vec<Pattern>,
    ignore: Vec<Pattern>,
}

/// In-memory dialplan of literal extensions and `_` patterns
#[derive(Debug, Clone, Default)]
pub struct StaticDialplan {
    contexts: HashMap<String, Context>,
}

impl StaticDialplan {
    pub fn new() -> Self {
        Self::default()
    }

    fn context_mut(&mut self, context: &str) -> &mut Context {
        self.contexts.entry(context.to_ascii_lowercase()).or_default()
    }

    fn context(&self, context: &str) -> Option<&Context> {
        self.contexts.get(&context.to_ascii_lowercase())
    }

    pub fn add_extension(&mut self, context: &str, extension: &str) {
        self.context_mut(context).extensions.push(Pattern::new(extension));
    }

    pub fn add_ignore_pattern(&mut self, context: &str, pattern: &str) {
        self.context_mut(context).ignore.push(Pattern::new(pattern));
    }

    /// Dialplan described by the configuration's `dialplan` section
    pub fn from_config(config: &Config) -> Self {
        let mut plan = Self::new();
        for (context, entries) in &config.dialplan {
            for ext in &entries.extensions {
                plan.add_extension(context, ext);
            }
            for pattern in &entries.ignore {
                plan.add_ignore_pattern(context, pattern);
            }
        }
        plan
    }

    /// Builder form used in tests
    pub fn with_extensions(mut self, context: &str, extensions: &[&str]) -> Self {
        for ext in extensions {
            self.add_extension(context, ext);
        }
        self
    }
}

impl Dialplan for StaticDialplan {
    fn exists(&self, context: &str, number: &str) -> bool {
        self.context(context)
            .map(|c| c.extensions.iter().any(|p| p.matches(number)))
            .unwrap_or(false)
    }

    fn can_match(&self, context: &str, number: &str) -> bool {
        self.context(context)
            .map(|c| c.extensions.iter().any(|p| p.can_match(number)))
            .unwrap_or(false)
    }

    fn match_more(&self, context: &str, number: &str) -> bool {
        self.context(context)
            .map(|c| c.extensions.iter().any(|p| p.match_more(number)))
            .unwrap_or(false)
    }

    fn ignore_pattern(&self, context: &str, number: &str) -> bool {
        self.context(context)
            .map(|c| c.ignore.iter().any(|p| p.can_match(number) || p.matches(number)))
            .unwrap_or(false)
    }

    fn extensions(&self, context: &str) -> Vec<String> {
        self.context(context)
            .map(|c| {
                c.extensions
                    .iter()
                    .filter(|p| p.is_literal())
                    .map(|p| p.source().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}
