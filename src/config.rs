//! Agent configuration loading.
//!
//! The controller agent keeps its configuration in
//! `<data dir>/agents/<tag>/agent.conf`.  The first line names the on-disk
//! format (`# format 2.0`); the rest is YAML decoded by the function
//! registered for that version in [`FORMATS`].  Unknown versions are
//! rejected, never parsed best-effort.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use garde::Validate;
use serde::Deserialize;

use crate::errors::{BackstopError, Result};

/// File name of the agent config.
pub const AGENT_CONFIG_FILENAME: &str = "agent.conf";

/// Default base directory holding every agent's data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/controller";

/// Default directory for agent logs.
pub const DEFAULT_LOG_DIR: &str = "/var/log/controller";

const FORMAT_PREFIX: &str = "# format ";

/// Decoder for one on-disk format version.
pub type FormatDecoder = fn(&str) -> Result<AgentConfig>;

/// Registered format versions.
pub const FORMATS: &[(&str, FormatDecoder)] = &[("2.0", decode_format_2_0)];

// -- Tags --------------------------------------------------------------------

/// Identity of an agent: `machine-N` or `controller-N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTag {
    Machine(u64),
    Controller(u64),
}

impl FromStr for AgentTag {
    type Err = BackstopError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BackstopError::InvalidConfig(format!("{s:?} is not a valid agent tag"));
        let (kind, id) = s.split_once('-').ok_or_else(invalid)?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let id: u64 = id.parse().map_err(|_| invalid())?;
        match kind {
            "machine" => Ok(AgentTag::Machine(id)),
            "controller" => Ok(AgentTag::Controller(id)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for AgentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentTag::Machine(id) => write!(f, "machine-{id}"),
            AgentTag::Controller(id) => write!(f, "controller-{id}"),
        }
    }
}

// -- Paths -------------------------------------------------------------------

/// Directory holding every agent's subdirectory.
pub fn base_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("agents")
}

/// Directory of one agent.
pub fn agent_dir(data_dir: &Path, tag: &AgentTag) -> PathBuf {
    base_dir(data_dir).join(tag.to_string())
}

/// Full path to an agent's config file.
pub fn config_path(data_dir: &Path, tag: &AgentTag) -> PathBuf {
    agent_dir(data_dir, tag).join(AGENT_CONFIG_FILENAME)
}

// -- Config ------------------------------------------------------------------

/// Details needed to run a controller. Present only on controller machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateServingInfo {
    pub api_port: u16,
    pub controller_api_port: u16,
    pub cert: String,
    pub private_key: String,
    pub ca_private_key: String,
    pub shared_secret: String,
    pub system_identity: String,
}

/// Read-only agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    tag: AgentTag,
    data_dir: PathBuf,
    log_dir: PathBuf,
    ca_cert: String,
    controller: Option<String>,
    model: Option<String>,
    api_addresses: Vec<String>,
    serving_info: Option<StateServingInfo>,
    path: Option<PathBuf>,
}

impl AgentConfig {
    pub fn tag(&self) -> &AgentTag {
        &self.tag
    }

    /// Base data directory; each agent has a subdirectory in it.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// CA certificate (PEM) used to validate controller certificates.
    pub fn ca_cert(&self) -> &str {
        &self.ca_cert
    }

    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Advertised API addresses of the controllers.
    pub fn api_addresses(&self) -> Result<Vec<String>> {
        if self.api_addresses.is_empty() {
            return Err(BackstopError::not_found("API addresses in agent config"));
        }
        Ok(self.api_addresses.clone())
    }

    pub fn state_serving_info(&self) -> Option<&StateServingInfo> {
        self.serving_info.as_ref()
    }

    /// File the config was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// -- Format 2.0 --------------------------------------------------------------

/// YAML layout of format 2.0.
#[derive(Debug, Clone, Deserialize, Validate)]
struct Format2_0 {
    #[garde(pattern(r"^(machine|controller)-[0-9]+$"))]
    tag: String,

    #[serde(default, rename = "datadir")]
    #[garde(skip)]
    data_dir: String,

    #[serde(default, rename = "logdir")]
    #[garde(skip)]
    log_dir: String,

    #[serde(default, rename = "cacert")]
    #[garde(skip)]
    ca_cert: String,

    #[serde(default)]
    #[garde(pattern(r"^controller-[0-9a-f-]+$"))]
    controller: Option<String>,

    #[serde(default)]
    #[garde(pattern(r"^model-[0-9a-f-]+$"))]
    model: Option<String>,

    #[serde(default, rename = "apiaddresses")]
    #[garde(inner(length(min = 1)))]
    api_addresses: Vec<String>,

    #[serde(default, rename = "controllercert")]
    #[garde(skip)]
    controller_cert: String,

    #[serde(default, rename = "controllerkey")]
    #[garde(skip)]
    controller_key: String,

    #[serde(default, rename = "caprivatekey")]
    #[garde(skip)]
    ca_private_key: String,

    #[serde(default, rename = "apiport")]
    #[garde(skip)]
    api_port: u16,

    #[serde(default, rename = "controllerapiport")]
    #[garde(skip)]
    controller_api_port: u16,

    #[serde(default, rename = "sharedsecret")]
    #[garde(skip)]
    shared_secret: String,

    #[serde(default, rename = "systemidentity")]
    #[garde(skip)]
    system_identity: String,
}

fn decode_format_2_0(body: &str) -> Result<AgentConfig> {
    let format: Format2_0 = serde_yaml::from_str(body)
        .map_err(|e| BackstopError::corruption("agent config", e))?;
    format
        .validate()
        .map_err(|report| BackstopError::InvalidConfig(report.to_string()))?;

    let serving_info = (!format.controller_key.is_empty()).then(|| StateServingInfo {
        api_port: format.api_port,
        controller_api_port: format.controller_api_port,
        cert: format.controller_cert.clone(),
        private_key: format.controller_key.clone(),
        ca_private_key: format.ca_private_key.clone(),
        shared_secret: format.shared_secret.clone(),
        system_identity: format.system_identity.clone(),
    });

    Ok(AgentConfig {
        tag: format.tag.parse()?,
        data_dir: non_empty_or(format.data_dir, DEFAULT_DATA_DIR),
        log_dir: non_empty_or(format.log_dir, DEFAULT_LOG_DIR),
        ca_cert: format.ca_cert,
        controller: format.controller,
        model: format.model,
        api_addresses: format.api_addresses,
        serving_info,
        path: None,
    })
}

fn non_empty_or(value: String, default: &str) -> PathBuf {
    if value.is_empty() {
        PathBuf::from(default)
    } else {
        PathBuf::from(value)
    }
}

// -- Loader ------------------------------------------------------------------

/// Decode agent config text, dispatching on its format header.
pub fn parse_config(contents: &str) -> Result<AgentConfig> {
    let (header, body) = contents.split_once('\n').unwrap_or((contents, ""));
    let version = header
        .trim_end()
        .strip_prefix(FORMAT_PREFIX)
        .ok_or_else(|| BackstopError::corruption("agent config", "missing format header"))?
        .trim();

    let decode = FORMATS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, decode)| decode)
        .ok_or_else(|| BackstopError::UnsupportedFormat {
            version: version.to_string(),
        })?;
    decode(body)
}

/// Load agent config from the file at `path`.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| BackstopError::io(path, e))?;
    let mut config = parse_config(&contents)?;
    config.path = Some(path.to_path_buf());
    Ok(config)
}
