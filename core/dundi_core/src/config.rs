//! Node configuration
//!
//! Configuration is read from JSON. Invalid peers and mappings are logged
//! and skipped so one bad entry never prevents the rest from loading.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::eid::Eid;
use crate::mapping::{parse_option, Mapping, MappingOption, Tech, MAX_WEIGHT};
use crate::peer::{parse_model, parse_order, Permission, PeerHost};
use crate::request::EntityInfo;
use crate::wire::DUNDI_PORT;

/// Default hop budget for queries we originate
pub const DEFAULT_TTL: u16 = 120;
/// Default answer cache lifetime, seconds
pub const DEFAULT_CACHE_TIME: u32 = 3600;
/// Default session key lifetime, seconds
pub const DEFAULT_KEY_TTL: u64 = 3600;
/// Autokill used when `autokill = true`
pub const DEFAULT_AUTOKILL_MS: u64 = 2000;
/// Upper bound of the retransmission interval
pub const DEFAULT_RETRANS_TIMER_MS: u64 = 1000;
/// Transmissions per packet before the transaction is given up
pub const DEFAULT_RETRANS: u32 = 5;
/// Qualify threshold used when `qualify = true`
pub const DEFAULT_MAXMS: u32 = 2000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "unable to read {}: {}", path.display(), e),
            ConfigError::Parse(msg) => write!(f, "parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// File format
// ============================================================================

/// `false`, `true` or a number of milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Toggle {
    Flag(bool),
    Millis(u64),
}

impl Default for Toggle {
    fn default() -> Self {
        Toggle::Flag(false)
    }
}

impl Toggle {
    fn millis(self, when_true: u64) -> Option<u64> {
        match self {
            Toggle::Flag(false) | Toggle::Millis(0) => None,
            Toggle::Flag(true) => Some(when_true),
            Toggle::Millis(ms) => Some(ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub port: u16,
    pub bindaddr: String,
    pub entityid: Option<String>,
    pub ttl: u16,
    pub autokill: Toggle,
    pub cachetime: u32,
    pub keyttl: u64,
    pub storehistory: bool,
    pub secretpath: String,
    pub keydir: String,
    pub department: String,
    pub organization: String,
    pub locality: String,
    pub stateprov: String,
    pub country: String,
    pub email: String,
    pub phone: String,
    pub ipaddr: String,
    pub workers: usize,
    pub worker_queue: usize,
    pub push_grace: i64,
    pub pull_grace: i64,
    pub retrans_timer_ms: u64,
    pub retrans_count: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            port: DUNDI_PORT,
            bindaddr: "0.0.0.0".to_string(),
            entityid: None,
            ttl: DEFAULT_TTL,
            autokill: Toggle::Flag(false),
            cachetime: DEFAULT_CACHE_TIME,
            keyttl: DEFAULT_KEY_TTL,
            storehistory: false,
            secretpath: "dundi".to_string(),
            keydir: "keys".to_string(),
            department: String::new(),
            organization: String::new(),
            locality: String::new(),
            stateprov: String::new(),
            country: String::new(),
            email: String::new(),
            phone: String::new(),
            ipaddr: String::new(),
            workers: 4,
            worker_queue: 64,
            push_grace: 10,
            pull_grace: 10,
            retrans_timer_ms: DEFAULT_RETRANS_TIMER_MS,
            retrans_count: DEFAULT_RETRANS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub eid: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub precache: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub noinclude: Vec<String>,
    #[serde(default)]
    pub permit: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub inkey: Option<String>,
    #[serde(default)]
    pub outkey: Option<String>,
    #[serde(default)]
    pub qualify: Toggle,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub ustothem: Option<String>,
}

fn default_host() -> String {
    "dynamic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub dcontext: String,
    pub lcontext: String,
    #[serde(default)]
    pub weight: u32,
    pub tech: String,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub peers: Vec<PeerConfig>,
    pub mappings: Vec<MappingConfig>,
    /// Local contexts served by the built-in dialplan
    pub dialplan: BTreeMap<String, DialplanContextConfig>,
}

/// Extensions and ignore patterns of one local context
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialplanContextConfig {
    pub extensions: Vec<String>,
    pub ignore: Vec<String>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

// ============================================================================
// Validated settings
// ============================================================================

/// Global settings after validation
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub us: Eid,
    pub ttl: u16,
    pub autokill: Option<Duration>,
    pub cachetime: u32,
    pub keyttl: Duration,
    pub storehistory: bool,
    pub secretpath: String,
    pub keydir: PathBuf,
    pub identity: EntityInfo,
    pub workers: usize,
    pub worker_queue: usize,
    pub push_grace: i64,
    pub pull_grace: i64,
    pub retrans_timer: Duration,
    pub retrans_count: u32,
}

impl Settings {
    /// Validate the general section. An unusable bind address is fatal, a
    /// bad entity id falls back to a random one.
    pub fn from_config(general: &GeneralConfig) -> Result<Self, ConfigError> {
        let ip: IpAddr = general
            .bindaddr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bindaddr '{}'", general.bindaddr)))?;

        let us = match &general.entityid {
            Some(text) => match text.parse::<Eid>() {
                Ok(eid) => eid,
                Err(e) => {
                    log::warn!("{}, using a random entity id", e);
                    Eid::random()
                }
            },
            None => Eid::random(),
        };

        Ok(Self {
            bind: SocketAddr::new(ip, general.port),
            us,
            ttl: general.ttl,
            autokill: general
                .autokill
                .millis(DEFAULT_AUTOKILL_MS)
                .map(Duration::from_millis),
            cachetime: general.cachetime.max(1),
            keyttl: Duration::from_secs(general.keyttl.max(1)),
            storehistory: general.storehistory,
            secretpath: general.secretpath.clone(),
            keydir: PathBuf::from(&general.keydir),
            identity: EntityInfo {
                department: general.department.clone(),
                organization: general.organization.clone(),
                locality: general.locality.clone(),
                stateprov: general.stateprov.clone(),
                country: general.country.clone(),
                email: general.email.clone(),
                phone: general.phone.clone(),
                ipaddr: general.ipaddr.clone(),
            },
            workers: general.workers.max(1),
            worker_queue: general.worker_queue.max(1),
            push_grace: general.push_grace,
            pull_grace: general.pull_grace,
            retrans_timer: Duration::from_millis(general.retrans_timer_ms.clamp(10, 60_000)),
            retrans_count: general.retrans_count.max(1),
        })
    }
}

/// A validated peer entry
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub eid: Eid,
    pub us_eid: Eid,
    pub host: PeerHost,
    pub addr: Option<SocketAddr>,
    pub include: Vec<Permission>,
    pub permit: Vec<Permission>,
    pub inkey: Option<String>,
    pub outkey: Option<String>,
    pub model: u8,
    pub pcmodel: u8,
    pub order: u32,
    pub maxms: u32,
    pub register: bool,
}

fn rules(allow: &[String], deny: &[String]) -> Vec<Permission> {
    allow
        .iter()
        .map(|name| Permission::allow(name))
        .chain(deny.iter().map(|name| Permission::deny(name)))
        .collect()
}

/// Validate one peer entry
pub fn build_peer(pc: &PeerConfig, us: Eid) -> Result<PeerSpec, ConfigError> {
    let eid: Eid = pc
        .eid
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}", e)))?;
    if eid == us {
        return Err(ConfigError::Invalid(format!("peer '{}' is our own entity id", eid)));
    }

    let model = match &pc.model {
        Some(name) => parse_model(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown model '{}' for peer '{}'", name, eid)))?,
        None => 0,
    };
    let pcmodel = match &pc.precache {
        Some(name) => parse_model(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown precache model '{}' for peer '{}'", name, eid)))?,
        None => 0,
    };
    if model == 0 && pcmodel == 0 {
        return Err(ConfigError::Invalid(format!("peer '{}' has neither a model nor a precache model", eid)));
    }
    let order = match &pc.order {
        Some(name) => parse_order(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown order '{}' for peer '{}'", name, eid)))?,
        None => 0,
    };

    let us_eid = match &pc.ustothem {
        Some(text) => text
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{}", e)))?,
        None => us,
    };

    let port = pc.port.unwrap_or(DUNDI_PORT);
    let (host, addr) = if pc.host.eq_ignore_ascii_case("dynamic") {
        (PeerHost::Dynamic, None)
    } else {
        let addr = (pc.host.as_str(), port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::Invalid(format!("unable to resolve host '{}' for peer '{}'", pc.host, eid)))?;
        (PeerHost::Static(pc.host.clone()), Some(addr))
    };

    let include = rules(&pc.include, &pc.noinclude);
    let permit = rules(&pc.permit, &pc.deny);
    if model & crate::peer::MODEL_OUTBOUND != 0 && include.is_empty() {
        log::warn!("Peer '{}' is outbound but includes no contexts", eid);
    }
    if model & crate::peer::MODEL_INBOUND != 0 && permit.is_empty() {
        log::warn!("Peer '{}' is inbound but permits no contexts", eid);
    }
    if pc.register && host != PeerHost::Dynamic && addr.is_none() {
        log::warn!("Peer '{}' has registration enabled but no address", eid);
    }

    Ok(PeerSpec {
        eid,
        us_eid,
        host,
        addr,
        include,
        permit,
        inkey: pc.inkey.clone().filter(|k| !k.is_empty()),
        outkey: pc.outkey.clone().filter(|k| !k.is_empty()),
        model,
        pcmodel,
        order,
        maxms: pc.qualify.millis(DEFAULT_MAXMS as u64).map(|ms| ms as u32).unwrap_or(0),
        register: pc.register,
    })
}

/// Validate one mapping entry
pub fn build_mapping(mc: &MappingConfig) -> Result<Mapping, ConfigError> {
    if mc.dcontext.is_empty() {
        return Err(ConfigError::Invalid("mapping without a DUNDi context".to_string()));
    }
    if mc.weight > MAX_WEIGHT as u32 {
        return Err(ConfigError::Invalid(format!(
            "invalid weight {} for mapping '{}' (max {})",
            mc.weight, mc.dcontext, MAX_WEIGHT
        )));
    }
    let tech = Tech::from_name(&mc.tech).ok_or_else(|| {
        ConfigError::Invalid(format!("unknown technology '{}' for mapping '{}'", mc.tech, mc.dcontext))
    })?;
    let mut options = 0;
    let mut nopartial = false;
    for name in &mc.options {
        match parse_option(name) {
            Some(MappingOption::Flag(flag)) => options |= flag,
            Some(MappingOption::NoPartial) => nopartial = true,
            None => log::warn!("Don't know anything about mapping option '{}'", name),
        }
    }
    Ok(Mapping {
        dcontext: mc.dcontext.clone(),
        lcontext: mc.lcontext.clone(),
        weight: mc.weight as u16,
        tech,
        dest: mc.dest.clone(),
        options,
        nopartial,
    })
}

/// Validate every peer, dropping the bad ones with a warning
pub fn build_peers(config: &Config, us: Eid) -> Vec<PeerSpec> {
    config
        .peers
        .iter()
        .filter_map(|pc| match build_peer(pc, us) {
            Ok(spec) => Some(spec),
            Err(e) => {
                log::warn!("Ignoring peer: {}", e);
                None
            }
        })
        .collect()
}

/// Validate every mapping, dropping the bad ones with a warning
pub fn build_mappings(config: &Config) -> Vec<Mapping> {
    config
        .mappings
        .iter()
        .filter_map(|mc| match build_mapping(mc) {
            Ok(map) => Some(map),
            Err(e) => {
                log::warn!("Ignoring mapping: {}", e);
                None
            }
        })
        .collect()
}
