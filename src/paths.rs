//! Mapping between remote file identities and local cache paths
//!
//! Cached files live at `<root>/<scheme>/<host>_<port>/<relative>`. The
//! layout is the only persisted metadata: a local path alone is enough to
//! recover which remote file it mirrors, which is what makes reload after
//! a restart possible. The mapping must therefore stay stable and
//! injective for a given root; anything that does not parse back cleanly
//! is treated as foreign and skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Remote file system flavors the cache can mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DfsScheme {
    Hdfs,
    S3a,
    Gs,
    Local,
}

impl DfsScheme {
    /// Stable string form used in the on-disk layout
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hdfs => "hdfs",
            Self::S3a => "s3a",
            Self::Gs => "gs",
            Self::Local => "file",
        }
    }

    /// Parse the on-disk string form; unknown schemes fail the decode
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hdfs" => Some(Self::Hdfs),
            "s3a" => Some(Self::S3a),
            "gs" => Some(Self::Gs),
            "file" => Some(Self::Local),
            _ => None,
        }
    }
}

impl fmt::Display for DfsScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one remote file system namenode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub scheme: DfsScheme,
    pub host: String,
    pub port: u16,
}

impl RemoteIdentity {
    pub fn new(scheme: DfsScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Render `scheme://host:port` for diagnostics
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Bidirectional codec between remote identities and local cache paths
#[derive(Debug, Clone)]
pub struct PathCodec {
    root: PathBuf,
}

impl PathCodec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root this codec encodes under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote identity plus relative name to its local cache path.
    ///
    /// A leading separator on `relative` is stripped so that
    /// DFS-absolute names such as `/warehouse/t/part-0` still land under
    /// the root.
    pub fn to_local(&self, identity: &RemoteIdentity, relative: &str) -> PathBuf {
        let relative = relative.trim_start_matches('/');
        self.root
            .join(identity.scheme.as_str())
            .join(format!("{}_{}", identity.host, identity.port))
            .join(relative)
    }

    /// Recover the remote identity and relative name from a local path.
    ///
    /// Returns `None` when the path lies outside the root, names an
    /// unknown scheme, or its `<host>_<port>` component is malformed.
    /// Hosts never contain underscores, but the split is on the last one
    /// so a surprising host cannot shift the port.
    pub fn from_local(&self, local: &Path) -> Option<(RemoteIdentity, String)> {
        let rest = local.strip_prefix(&self.root).ok()?;

        let mut components = rest.components();
        let scheme = match components.next()? {
            Component::Normal(s) => DfsScheme::parse(s.to_str()?)?,
            _ => return None,
        };
        let endpoint = match components.next()? {
            Component::Normal(s) => s.to_str()?,
            _ => return None,
        };
        let (host, port) = endpoint.rsplit_once('_')?;
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;

        let mut relative = String::new();
        for component in components {
            match component {
                Component::Normal(s) => {
                    if !relative.is_empty() {
                        relative.push('/');
                    }
                    relative.push_str(s.to_str()?);
                }
                _ => return None,
            }
        }
        if relative.is_empty() {
            return None;
        }

        Some((RemoteIdentity::new(scheme, host, port), relative))
    }

    /// Render the full remote URI for a decoded file, for diagnostics
    pub fn remote_uri(identity: &RemoteIdentity, relative: &str) -> String {
        format!("{}/{}", identity.endpoint(), relative.trim_start_matches('/'))
    }
}
