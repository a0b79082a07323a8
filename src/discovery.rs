// Package discovery: parses toolchain listings and resolves which referenced
// packages ship a resource plugin.

use crate::error::{DiscoveryError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Package whose presence marks a program as a deployment program
pub const SDK_PACKAGE: &str = "Pulumi";
pub const PLUGIN_METADATA_FILE: &str = "pulumi-plugin.json";
pub const VERSION_FILE: &str = "version.txt";

const PACKAGE_DIR_MARKER: &str = "global-packages:";
const SDK_PREFIX: &str = "Pulumi.";

/// A referenced package and its resolved version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
}

/// One row of `dotnet list package`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameterization {
    pub name: String,
    pub version: String,
    /// Opaque payload forwarded to the plugin as-is
    #[serde(default)]
    pub value: String,
}

/// Contents of `pulumi-plugin.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub resource: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub parameterization: Option<Parameterization>,
}

/// Legacy `version.txt`: either `version` or `name\nversion`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionFile {
    pub name: Option<String>,
    pub version: String,
}

impl VersionFile {
    pub fn parse(contents: &str) -> Self {
        let contents = contents.trim();
        let (name, version) = match contents.split_once('\n') {
            Some((name, version)) => (Some(name.trim().to_string()), version.trim()),
            None => (None, contents),
        };

        let version = if version.starts_with('v') {
            version.to_string()
        } else {
            format!("v{version}")
        };

        Self {
            name: name.filter(|n| !n.is_empty()),
            version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Resource,
}

/// A plugin the program needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub kind: PluginKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameterization: Option<Parameterization>,
}

#[derive(Debug, thiserror::Error)]
pub enum TolerantVersionError {
    #[error("short version cannot contain prerelease or build metadata")]
    ShortWithSuffix,
    #[error(transparent)]
    Semver(#[from] semver::Error),
}

/// Parse a version leniently: surrounding space, a leading `v`, leading
/// zeros and missing minor or patch components are accepted. A shortened
/// version may not carry a prerelease or build suffix.
pub fn parse_tolerant(version: &str) -> std::result::Result<Version, TolerantVersionError> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    let mut parts: Vec<String> = trimmed
        .splitn(3, '.')
        .map(|part| {
            if part.len() < 2 {
                return part.to_string();
            }
            let stripped = part.trim_start_matches('0');
            if stripped.starts_with(|c: char| c.is_ascii_digit()) {
                stripped.to_string()
            } else {
                format!("0{stripped}")
            }
        })
        .collect();

    if parts.len() < 3 {
        if parts.last().is_some_and(|last| last.contains(['+', '-'])) {
            return Err(TolerantVersionError::ShortWithSuffix);
        }
        parts.resize(3, "0".to_string());
    }

    Ok(Version::parse(&parts.join("."))?)
}

/// Extract `(name, resolved version)` pairs from `dotnet list package
/// --include-transitive`, dropping the SDK package and repeated names.
///
/// ```text
/// Top-level Package      Requested   Resolved
/// > Pulumi               3.60.0      3.60.0
///
/// Transitive Package                 Resolved
/// > Grpc.Net.Client                  2.52.0
/// ```
pub fn parse_package_list(output: &str, command: &str) -> Result<Vec<PackageRecord>> {
    let mut saw_sdk = false;
    let mut seen = HashSet::new();
    let mut packages = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[0] != ">" {
            continue;
        }

        let name = fields[1];
        if name == SDK_PACKAGE {
            saw_sdk = true;
            continue;
        }

        let version = fields[fields.len() - 1];
        if seen.insert(name.to_string()) {
            packages.push(PackageRecord {
                name: name.to_string(),
                version: version.to_string(),
            });
        } else {
            trace!(package = name, version, "Skipping repeated package");
        }
    }

    if !saw_sdk && packages.is_empty() {
        return Err(DiscoveryError::NoPackages {
            command: command.to_string(),
            sdk_package: SDK_PACKAGE.to_string(),
        }
        .into());
    }

    debug!(count = packages.len(), "Found candidate packages");
    Ok(packages)
}

/// Extract the cache path from `dotnet nuget locals global-packages --list`,
/// e.g. `info : global-packages: /home/user/.nuget/packages/`.
pub fn parse_package_directory(output: &str, command: &str) -> Result<PathBuf> {
    let Some(index) = output.find(PACKAGE_DIR_MARKER) else {
        return Err(DiscoveryError::UnexpectedOutput {
            command: command.to_string(),
            output: output.to_string(),
        }
        .into());
    };

    let dir = output[index + PACKAGE_DIR_MARKER.len()..].trim();
    Ok(PathBuf::from(dir))
}

/// Parse `dotnet list package` rows for dependency reporting. Top-level rows
/// are `> name requested resolved`, transitive rows `> name resolved`; any
/// other `>` row is an error.
pub fn parse_dependency_list(output: &str, command: &str) -> Result<Vec<DependencyInfo>> {
    let mut dependencies = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        let Some(row) = line.strip_prefix('>') else {
            continue;
        };

        let fields: Vec<&str> = row.split_whitespace().collect();
        let version = match fields.len() {
            3 => fields[2],
            2 => fields[1],
            _ => {
                return Err(DiscoveryError::MalformedRow {
                    command: command.to_string(),
                    line: line.to_string(),
                }
                .into())
            }
        };

        dependencies.push(DependencyInfo {
            name: fields[0].to_string(),
            version: version.to_string(),
        });
    }

    Ok(dependencies)
}

fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn load_metadata(path: &Path) -> Result<Option<PluginMetadata>> {
    let Some(contents) = read_optional(path).map_err(|e| DiscoveryError::MetadataRead {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?
    else {
        return Ok(None);
    };

    let metadata = serde_json::from_str(&contents).map_err(|e| DiscoveryError::MetadataParse {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    Ok(Some(metadata))
}

fn load_version_file(path: &Path) -> Result<Option<VersionFile>> {
    let contents = read_optional(path).map_err(|e| DiscoveryError::VersionFileRead {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    Ok(contents.as_deref().map(VersionFile::parse))
}

fn default_plugin_name(package: &str) -> String {
    package
        .strip_prefix(SDK_PREFIX)
        .unwrap_or(package)
        .to_lowercase()
}

/// Decide whether a restored package ships a plugin, by looking for sidecar
/// files under `<package_dir>/<lower(name)>/<version>/content/`.
///
/// Metadata values win over `version.txt`, which wins over the package's own
/// name and version.
pub fn determine_plugin_descriptor(
    package_dir: &Path,
    package: &str,
    version: &str,
) -> Result<Option<PluginDescriptor>> {
    let content_dir = package_dir
        .join(package.to_lowercase())
        .join(version)
        .join("content");
    trace!(path = %content_dir.display(), "Looking for plugin files");

    let metadata = load_metadata(&content_dir.join(PLUGIN_METADATA_FILE))?;
    if matches!(metadata, Some(ref m) if !m.resource) {
        debug!(package, "Package is explicitly not a resource plugin");
        return Ok(None);
    }

    let version_file = load_version_file(&content_dir.join(VERSION_FILE))?;
    if metadata.is_none() && version_file.is_none() {
        return Ok(None);
    }

    let metadata = metadata.unwrap_or_default();
    let version_file = version_file.unwrap_or_default();
    let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());

    let name = non_empty(&metadata.name)
        .or_else(|| non_empty(&version_file.name))
        .unwrap_or_else(|| default_plugin_name(package));
    let plugin_version = non_empty(&metadata.version)
        .or_else(|| Some(version_file.version.clone()).filter(|v| !v.is_empty()))
        .unwrap_or_else(|| version.to_string());

    if let Err(e) = parse_tolerant(&plugin_version) {
        return Err(DiscoveryError::InvalidVersion {
            package: package.to_string(),
            version: plugin_version,
            error: e.to_string(),
        }
        .into());
    }

    let descriptor = PluginDescriptor {
        name,
        version: plugin_version,
        server: non_empty(&metadata.server),
        kind: PluginKind::Resource,
        parameterization: metadata.parameterization,
    };
    debug!(package, plugin = %descriptor.name, version = %descriptor.version, "Resolved plugin");
    Ok(Some(descriptor))
}

/// Resolve descriptors for every package, in encounter order.
pub fn resolve_plugins(
    package_dir: &Path,
    packages: &[PackageRecord],
) -> Result<Vec<PluginDescriptor>> {
    let mut plugins = Vec::new();
    for package in packages {
        if let Some(plugin) =
            determine_plugin_descriptor(package_dir, &package.name, &package.version)?
        {
            plugins.push(plugin);
        }
    }
    Ok(plugins)
}
