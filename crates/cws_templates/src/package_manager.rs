//! Package manager capability table.
//!
//! Every per-manager decision (which package list to install, the install and
//! removal commands, the bootstrap block, which ecosystems are forbidden) is
//! answered here so callers match on one closed enum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::manifest::{Ecosystem, PackageDefinitions};

/// A supported package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Conda,
    Spack,
    /// Pre-baked image; nothing is installed at boot.
    Ami,
}

impl PackageManager {
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Conda,
        PackageManager::Spack,
        PackageManager::Ami,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Conda => "conda",
            PackageManager::Spack => "spack",
            PackageManager::Ami => "ami",
        }
    }

    /// Comma separated list of valid names, for error messages.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|pm| pm.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The ecosystem whose list this manager installs.
    pub fn ecosystem(&self) -> Option<Ecosystem> {
        match self {
            PackageManager::Apt | PackageManager::Dnf => Some(Ecosystem::System),
            PackageManager::Conda => Some(Ecosystem::Conda),
            PackageManager::Spack => Some(Ecosystem::Spack),
            PackageManager::Ami => None,
        }
    }

    /// Packages this manager installs from the template's lists.
    pub fn select_packages<'a>(&self, packages: &'a PackageDefinitions) -> &'a [String] {
        match self.ecosystem() {
            Some(ecosystem) => packages.list(ecosystem),
            None => &[],
        }
    }

    /// Whether this is the OS package manager.
    pub fn is_system(&self) -> bool {
        matches!(self, PackageManager::Apt | PackageManager::Dnf)
    }

    /// Ecosystems a template using this manager may not declare packages for.
    pub fn forbidden_ecosystems(&self) -> &'static [Ecosystem] {
        match self {
            PackageManager::Apt | PackageManager::Dnf => &[Ecosystem::Conda, Ecosystem::Spack],
            PackageManager::Ami => &Ecosystem::ALL,
            PackageManager::Conda | PackageManager::Spack => &[],
        }
    }

    /// Install command line for the given packages, `None` when there is
    /// nothing to install. Spack packages are added to a `default`
    /// environment and installed once by concretizing it.
    pub fn install_command(&self, packages: &[String]) -> Option<String> {
        if packages.is_empty() {
            return None;
        }
        let list = packages.join(" ");
        match self {
            PackageManager::Apt => Some(format!("apt-get install -y {}", list)),
            PackageManager::Dnf => Some(format!("dnf install -y {}", list)),
            PackageManager::Conda => Some(format!("/opt/miniforge/bin/conda install -y {}", list)),
            PackageManager::Spack => {
                let mut lines = vec![
                    "spack env create default".to_string(),
                    "spack env activate default".to_string(),
                ];
                lines.extend(packages.iter().map(|p| format!("spack add {}", p)));
                lines.push("spack concretize".to_string());
                lines.push("spack install".to_string());
                Some(lines.join("\n"))
            }
            PackageManager::Ami => None,
        }
    }

    /// Removal command line for the given packages.
    pub fn remove_command(&self, packages: &[String]) -> Option<String> {
        if packages.is_empty() {
            return None;
        }
        let list = packages.join(" ");
        match self {
            PackageManager::Apt => Some(format!("apt-get remove -y {}", list)),
            PackageManager::Dnf => Some(format!("dnf remove -y {}", list)),
            PackageManager::Conda => Some(format!("/opt/miniforge/bin/conda remove -y {}", list)),
            PackageManager::Spack => Some(format!("spack uninstall -y {}", list)),
            PackageManager::Ami => None,
        }
    }

    /// Command that refreshes and upgrades the system before installing.
    pub fn system_update(&self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf check-update -y || true\ndnf upgrade -y",
            PackageManager::Ami => "",
            _ => "apt-get update -y\napt-get upgrade -y",
        }
    }

    /// Cleanup commands run after installation.
    pub fn cleanup(&self) -> &'static str {
        match self {
            PackageManager::Apt | PackageManager::Spack => {
                "apt-get autoremove -y\napt-get autoclean"
            }
            PackageManager::Dnf => "dnf autoremove -y\ndnf clean all",
            PackageManager::Conda => {
                "/opt/miniforge/bin/conda clean -a -y\napt-get autoremove -y\napt-get autoclean"
            }
            PackageManager::Ami => "",
        }
    }

    /// Block that prepares the manager itself on a fresh instance.
    pub fn bootstrap(&self) -> &'static str {
        match self {
            PackageManager::Apt => APT_BOOTSTRAP,
            PackageManager::Dnf => DNF_BOOTSTRAP,
            PackageManager::Conda => CONDA_BOOTSTRAP,
            PackageManager::Spack => SPACK_BOOTSTRAP,
            PackageManager::Ami => "",
        }
    }
}

const APT_BOOTSTRAP: &str = "\
echo \"Installing base requirements...\"
apt-get install -y curl wget software-properties-common build-essential";

const DNF_BOOTSTRAP: &str = "\
echo \"Enabling EPEL repository...\"
dnf install -y epel-release || true
echo \"Installing base requirements...\"
dnf install -y curl wget ca-certificates gcc gcc-c++ make git
dnf groupinstall -y \"Development Tools\" || true";

const CONDA_BOOTSTRAP: &str = "\
apt-get install -y curl wget bzip2 ca-certificates
echo \"Installing Miniforge...\"
ARCH=$(uname -m)
MINIFORGE_RELEASES=\"https://github.com/conda-forge/miniforge/releases/latest/download\"
MINIFORGE_URL=\"$MINIFORGE_RELEASES/Miniforge3-Linux-${ARCH}.sh\"
wget -O /tmp/mf.sh \"$MINIFORGE_URL\" && bash /tmp/mf.sh -b -p /opt/miniforge && rm /tmp/mf.sh
export PATH=\"/opt/miniforge/bin:$PATH\"
echo 'export PATH=\"/opt/miniforge/bin:$PATH\"' >> /etc/environment
/opt/miniforge/bin/conda init bash";

const SPACK_BOOTSTRAP: &str = "\
echo \"Installing Spack dependencies...\"
apt-get install -y build-essential ca-certificates coreutils curl environment-modules \\
    gfortran git gpg lsb-release python3 python3-venv unzip zip
echo \"Installing Spack...\"
git clone -c feature.manyFiles=true https://github.com/spack/spack.git /opt/spack
git -C /opt/spack checkout releases/v0.21
echo 'export SPACK_ROOT=/opt/spack' >> /etc/environment
echo '. /opt/spack/share/spack/setup-env.sh' >> /etc/bash.bashrc
export SPACK_ROOT=/opt/spack
export PATH=\"$SPACK_ROOT/bin:$PATH\"
set +u
. $SPACK_ROOT/share/spack/setup-env.sh
set -u
spack compiler find
spack external find";

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apt" => Ok(PackageManager::Apt),
            "dnf" => Ok(PackageManager::Dnf),
            "conda" => Ok(PackageManager::Conda),
            "spack" => Ok(PackageManager::Spack),
            "ami" => Ok(PackageManager::Ami),
            _ => Err(TemplateError::UnsupportedPackageManager(s.to_string())),
        }
    }
}
