//! Configuration of an application entity's Upper Layer.
//!
//! [`UpperLayerConfig`] can be built in code,
//! or loaded from a TOML document such as:
//!
//! ```toml
//! ae_title = "STORE-SCP"
//! max_pdu_length = 16384
//! max_associations = 4
//! idle_timeout_secs = 60
//!
//! [[presentation_contexts]]
//! abstract_syntax = "1.2.840.10008.1.1"
//! transfer_syntaxes = ["1.2.840.10008.1.2"]
//!
//! [remote]
//! ae_title = "ANY-SCP"
//! host = "127.0.0.1"
//! port = 104
//! ```
//!
//! Timeouts set to 0 are disabled.
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

use crate::dul::DulOptions;
use crate::pdu::{MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};

/// Verification SOP Class
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
/// Implicit VR Little Endian
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
/// Explicit VR Little Endian
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Presentation context IDs are odd numbers from 1 to 255.
pub const MAX_PRESENTATION_CONTEXTS: usize = 128;

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Could not read configuration file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not parse configuration
    Parse {
        source: toml::de::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("AE title `{}` must be 1 to 16 characters long", ae_title))]
    InvalidAeTitle {
        ae_title: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Maximum PDU length {} must be 0 or between {} and {}",
        max_pdu_length,
        MINIMUM_PDU_SIZE,
        MAXIMUM_PDU_SIZE
    ))]
    InvalidMaxPduLength {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// maximum number of associations must be at least 1
    InvalidMaxAssociations { backtrace: Backtrace },

    /// poll interval must be positive
    InvalidPollInterval { backtrace: Backtrace },

    #[snafu(display("Presentation context for `{}` has no transfer syntax", abstract_syntax))]
    NoTransferSyntax {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    /// no presentation contexts configured
    NoPresentationContexts { backtrace: Backtrace },

    #[snafu(display("{} presentation contexts given, at most 128 fit in a request", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    /// no remote node configured
    MissingRemote { backtrace: Backtrace },

    #[snafu(display("Could not resolve remote address {}:{}", host, port))]
    ResolveRemote {
        host: String,
        port: u16,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Remote address {}:{} resolved to nothing", host, port))]
    UnresolvedRemote {
        host: String,
        port: u16,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Upper Layer settings of a local application entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpperLayerConfig {
    /// Local Application Entity Title
    #[serde(default = "default_ae_title")]
    pub ae_title: String,

    /// Maximum PDU length this node is willing to receive, 0 for unlimited
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,

    /// Maximum number of concurrent associations accepted
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,

    /// Time without activity after which an association is aborted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Time to wait for association negotiation and release responses
    #[serde(default = "default_acse_timeout")]
    pub acse_timeout_secs: u64,

    /// Time to wait for DIMSE messages
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_secs: u64,

    /// Time to wait for the transport connection to open
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on how long the association loop blocks between checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Refuse incoming PDUs larger than `max_pdu_length`
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Presentation contexts proposed (as requestor) or accepted (as acceptor)
    #[serde(default = "default_presentation_contexts")]
    pub presentation_contexts: Vec<PresentationContextConfig>,

    /// Peer to associate with when acting as requestor
    #[serde(default)]
    pub remote: Option<RemoteNode>,
}

/// A supported abstract syntax with its transfer syntaxes,
/// in order of preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationContextConfig {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    /// Whether the association requestor may act as SCU for this SOP class
    #[serde(default = "default_true")]
    pub scu_role: bool,
    /// Whether the association requestor may act as SCP for this SOP class
    #[serde(default)]
    pub scp_role: bool,
}

impl PresentationContextConfig {
    pub fn new<A, T, I>(abstract_syntax: A, transfer_syntaxes: I) -> Self
    where
        A: Into<String>,
        T: Into<String>,
        I: IntoIterator<Item = T>,
    {
        PresentationContextConfig {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.into_iter().map(Into::into).collect(),
            scu_role: true,
            scp_role: false,
        }
    }

    /// Set the roles the requestor may take for this SOP class.
    pub fn with_roles(mut self, scu_role: bool, scp_role: bool) -> Self {
        self.scu_role = scu_role;
        self.scp_role = scp_role;
        self
    }
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,
    /// Remote host address
    pub host: String,
    /// Remote port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl RemoteNode {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        RemoteNode {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    /// Resolve the node's socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .context(ResolveRemoteSnafu {
                host: &self.host,
                port: self.port,
            })?
            .next()
            .context(UnresolvedRemoteSnafu {
                host: &self.host,
                port: self.port,
            })
    }
}

fn default_ae_title() -> String {
    "THIS-SCP".to_string()
}

fn default_max_pdu_length() -> u32 {
    crate::pdu::DEFAULT_MAX_PDU
}

fn default_max_associations() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_acse_timeout() -> u64 {
    30
}

fn default_dimse_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_poll_interval() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    104
}

fn default_presentation_contexts() -> Vec<PresentationContextConfig> {
    vec![PresentationContextConfig::new(
        VERIFICATION_SOP_CLASS,
        [IMPLICIT_VR_LE, EXPLICIT_VR_LE],
    )]
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for UpperLayerConfig {
    fn default() -> Self {
        UpperLayerConfig {
            ae_title: default_ae_title(),
            max_pdu_length: default_max_pdu_length(),
            max_associations: default_max_associations(),
            idle_timeout_secs: default_idle_timeout(),
            acse_timeout_secs: default_acse_timeout(),
            dimse_timeout_secs: default_dimse_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            strict: true,
            presentation_contexts: default_presentation_contexts(),
            remote: None,
        }
    }
}

impl UpperLayerConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: UpperLayerConfig = toml::from_str(text).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.ae_title.trim().is_empty() && self.ae_title.len() <= 16,
            InvalidAeTitleSnafu {
                ae_title: &self.ae_title
            }
        );
        ensure!(
            self.max_pdu_length == 0
                || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduLengthSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );
        ensure!(self.max_associations >= 1, InvalidMaxAssociationsSnafu);
        ensure!(self.poll_interval_ms > 0, InvalidPollIntervalSnafu);
        ensure!(
            !self.presentation_contexts.is_empty(),
            NoPresentationContextsSnafu
        );
        ensure!(
            self.presentation_contexts.len() <= MAX_PRESENTATION_CONTEXTS,
            TooManyPresentationContextsSnafu {
                count: self.presentation_contexts.len()
            }
        );
        for pc in &self.presentation_contexts {
            ensure!(
                !pc.transfer_syntaxes.is_empty(),
                NoTransferSyntaxSnafu {
                    abstract_syntax: &pc.abstract_syntax
                }
            );
        }
        if let Some(remote) = &self.remote {
            ensure!(
                !remote.ae_title.trim().is_empty() && remote.ae_title.len() <= 16,
                InvalidAeTitleSnafu {
                    ae_title: &remote.ae_title
                }
            );
        }
        Ok(())
    }

    /// The configured remote node, if any.
    pub fn remote(&self) -> Result<&RemoteNode> {
        self.remote.as_ref().context(MissingRemoteSnafu)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }

    pub fn acse_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.acse_timeout_secs)
    }

    pub fn dimse_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.dimse_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Options for the DUL service provider of an association.
    pub fn dul_options(&self) -> DulOptions {
        DulOptions {
            max_pdu_length: self.max_pdu_length,
            strict: self.strict,
            artim_timeout: self.acse_timeout(),
            connect_timeout: self.connect_timeout(),
        }
    }
}
