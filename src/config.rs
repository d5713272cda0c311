// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Declarative build configuration.

The recognized option set; unknown keys are ignored so that surrounding
tools can carry their own options in the same document.
*/

use {
    crate::{
        compose::OutputFormat,
        dependency::SingleDependency,
        error::{BuildError, Result},
        repository::RepoConfig,
    },
    serde::Deserialize,
    std::{
        fmt::{Display, Formatter},
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// Target CPU architecture, in Debian naming.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CpuArch {
    Amd64,
    #[default]
    Arm64,
    Armhf,
    I386,
    Riscv64,
    /// Architecture-independent packages.
    All,
    /// No architecture restriction.
    Any,
}

impl CpuArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Armhf => "armhf",
            Self::I386 => "i386",
            Self::Riscv64 => "riscv64",
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

impl Display for CpuArch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CpuArch {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amd64" => Ok(Self::Amd64),
            "arm64" => Ok(Self::Arm64),
            "armhf" => Ok(Self::Armhf),
            "i386" => Ok(Self::I386),
            "riscv64" => Ok(Self::Riscv64),
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(BuildError::Config(format!("unknown architecture: {}", other))),
        }
    }
}

/// A host file (or directory) overlaid onto the staging tree.
#[derive(Clone, Debug, Deserialize)]
pub struct HostFile {
    /// Source path on the host.
    pub source: PathBuf,
    /// Destination path inside the image. Defaults to the source's file
    /// name at the root.
    #[serde(default)]
    pub destination: Option<String>,
    /// Permission bits as an octal string (e.g. `"755"`).
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

impl HostFile {
    /// Parse the configured mode, if any.
    pub fn mode_bits(&self) -> Result<Option<u32>> {
        self.mode
            .as_deref()
            .map(|s| {
                u32::from_str_radix(s, 8)
                    .map_err(|_| BuildError::Config(format!("bad file mode: {}", s)))
            })
            .transpose()
    }
}

/// Kind of a configured device node.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Char,
    Block,
}

/// A device node to create in the image.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceNode {
    /// Path under `/dev`.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

impl DeviceNode {
    /// Permission bits: configured, else the conventional default for the
    /// device kind.
    pub fn mode_bits(&self) -> Result<u32> {
        match self.mode.as_deref() {
            Some(s) => u32::from_str_radix(s, 8)
                .map_err(|_| BuildError::Config(format!("bad device mode: {}", s))),
            None => Ok(match self.kind {
                DeviceKind::Char => 0o200,
                DeviceKind::Block => 0o600,
            }),
        }
    }
}

fn default_output_format() -> OutputFormat {
    OutputFormat::TAR
}

/// The declarative build input.
#[derive(Clone, Debug, Deserialize)]
pub struct ImageConfig {
    /// Repositories in priority order.
    #[serde(default)]
    pub apt_repos: Vec<RepoConfig>,

    /// Root packages; entries may carry version constraints
    /// (`busybox (>= 1.30)`).
    #[serde(default)]
    pub packages: Vec<String>,

    /// Target architecture.
    #[serde(default)]
    pub arch: CpuArch,

    /// Host files overlaid after extraction.
    #[serde(default)]
    pub host_files: Vec<HostFile>,

    /// Output artifact format.
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,

    /// Apply all determinism rules.
    #[serde(default)]
    pub reproducible: bool,

    /// Seed the resolver with all `Essential: yes` packages.
    #[serde(default)]
    pub essential: bool,

    /// Artifact name stem. The generator picks its default.
    #[serde(default)]
    pub name: Option<String>,

    /// Kernel package (boot and initrd generators).
    #[serde(default)]
    pub kernel: Option<String>,

    /// Busybox package for the initrd. Defaults to `busybox-static`.
    #[serde(default)]
    pub busybox: Option<String>,

    /// Kernel modules to carry in the initrd, by module name.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Kernel version override for module lookup. Detected from the staged
    /// kernel package when absent.
    #[serde(default)]
    pub kernel_version: Option<String>,

    /// Device nodes to create.
    #[serde(default)]
    pub devices: Vec<DeviceNode>,

    /// Root device the initrd's `/init` should switch to.
    #[serde(default)]
    pub root_device: Option<String>,

    /// Template for the initrd's `/init` script.
    #[serde(default)]
    pub template: Option<PathBuf>,

    /// Result file patterns the boot generator copies out
    /// (e.g. `boot/vmlinuz*`, `*.dtb`).
    #[serde(default)]
    pub files: Vec<String>,
}

impl ImageConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse a configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// The root package references, constraints parsed.
    pub fn package_refs(&self) -> Result<Vec<SingleDependency>> {
        self.packages
            .iter()
            .map(|s| SingleDependency::parse(s))
            .collect()
    }
}
