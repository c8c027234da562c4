//! Instance sizing heuristics and hourly cost estimates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;
use crate::manifest::{Architecture, Template};

/// Hourly cost used for instance types missing from the cost table.
pub const FALLBACK_HOURLY_COST: f64 = 0.10;

const GPU_INDICATORS: &[&str] = &[
    "tensorflow-gpu",
    "pytorch",
    "cuda",
    "nvidia",
    "cupy",
    "numba",
    "rapids",
    "horovod",
    "tensorrt",
    "nccl",
];

const MEMORY_INDICATORS: &[&str] = &[
    "spark",
    "hadoop",
    "elasticsearch",
    "redis",
    "memcached",
    "r-base",
    "bioconductor",
    "genomics",
    "proteomics",
];

const CPU_INDICATORS: &[&str] = &[
    "openmpi", "mpich", "openmp", "mpi4py", "fftw", "blas", "lapack", "atlas", "mkl", "gfortran",
    "fortran", "hpc", "parallel",
];

/// Workload class inferred from a template's packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    Gpu,
    HighMemory,
    HighCpu,
    General,
}

impl WorkloadClass {
    /// Classify by substring match of package names against indicator sets,
    /// checked in the order GPU, memory, CPU. Package names are compared
    /// lowercased, so `PyTorch` counts as a GPU indicator.
    pub fn classify(template: &Template) -> Self {
        let packages: Vec<String> = template
            .all_packages()
            .map(|p| p.to_ascii_lowercase())
            .collect();
        let has_any = |indicators: &[&str]| {
            packages
                .iter()
                .any(|pkg| indicators.iter().any(|ind| pkg.contains(ind)))
        };

        if has_any(GPU_INDICATORS) {
            WorkloadClass::Gpu
        } else if has_any(MEMORY_INDICATORS) {
            WorkloadClass::HighMemory
        } else if has_any(CPU_INDICATORS) {
            WorkloadClass::HighCpu
        } else {
            WorkloadClass::General
        }
    }

    /// Five instance types, XS to XL, for an architecture.
    pub fn ladder(&self, arch: Architecture) -> [&'static str; 5] {
        match (self, arch) {
            (WorkloadClass::General, Architecture::X86_64) => {
                ["t3.small", "t3.medium", "t3.large", "t3.xlarge", "t3.2xlarge"]
            }
            (WorkloadClass::General, Architecture::Arm64) => {
                ["t4g.small", "t4g.medium", "t4g.large", "t4g.xlarge", "t4g.2xlarge"]
            }
            (WorkloadClass::HighCpu, Architecture::X86_64) => {
                ["c5.large", "c5.xlarge", "c5.2xlarge", "c5.4xlarge", "c5.9xlarge"]
            }
            (WorkloadClass::HighCpu, Architecture::Arm64) => {
                ["c6g.large", "c6g.xlarge", "c6g.2xlarge", "c6g.4xlarge", "c6g.8xlarge"]
            }
            (WorkloadClass::HighMemory, Architecture::X86_64) => {
                ["r5.large", "r5.xlarge", "r5.2xlarge", "r5.4xlarge", "r5.8xlarge"]
            }
            (WorkloadClass::HighMemory, Architecture::Arm64) => {
                ["r6g.large", "r6g.xlarge", "r6g.2xlarge", "r6g.4xlarge", "r6g.8xlarge"]
            }
            (WorkloadClass::Gpu, Architecture::X86_64) => [
                "g4dn.large",
                "g4dn.xlarge",
                "g4dn.2xlarge",
                "g4dn.4xlarge",
                "g4dn.8xlarge",
            ],
            (WorkloadClass::Gpu, Architecture::Arm64) => [
                "g5g.large",
                "g5g.xlarge",
                "g5g.2xlarge",
                "g5g.4xlarge",
                "g5g.8xlarge",
            ],
        }
    }

    pub fn instance_type(&self, arch: Architecture, size: InstanceSize) -> &'static str {
        self.ladder(arch)[size.index()]
    }

    /// Architecture → instance type for every architecture.
    pub fn instance_types(&self, size: InstanceSize) -> BTreeMap<String, String> {
        Architecture::ALL
            .into_iter()
            .map(|arch| (arch.to_string(), self.instance_type(arch, size).to_string()))
            .collect()
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadClass::Gpu => "gpu",
            WorkloadClass::HighMemory => "high-memory",
            WorkloadClass::HighCpu => "high-cpu",
            WorkloadClass::General => "general",
        };
        f.write_str(s)
    }
}

/// Requested instance size token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceSize {
    XS,
    S,
    #[default]
    M,
    L,
    XL,
}

impl InstanceSize {
    pub const ALL: [InstanceSize; 5] = [
        InstanceSize::XS,
        InstanceSize::S,
        InstanceSize::M,
        InstanceSize::L,
        InstanceSize::XL,
    ];

    fn index(&self) -> usize {
        match self {
            InstanceSize::XS => 0,
            InstanceSize::S => 1,
            InstanceSize::M => 2,
            InstanceSize::L => 3,
            InstanceSize::XL => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceSize::XS => "XS",
            InstanceSize::S => "S",
            InstanceSize::M => "M",
            InstanceSize::L => "L",
            InstanceSize::XL => "XL",
        }
    }
}

impl fmt::Display for InstanceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceSize {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "M" => Ok(InstanceSize::M),
            "XS" => Ok(InstanceSize::XS),
            "S" => Ok(InstanceSize::S),
            "L" => Ok(InstanceSize::L),
            "XL" => Ok(InstanceSize::XL),
            _ => Err(TemplateError::InvalidSize(s.to_string())),
        }
    }
}

/// On-demand hourly price (USD, us-east-1) of an instance type.
pub fn hourly_cost(instance_type: &str) -> Option<f64> {
    let cost = match instance_type {
        "t3.micro" => 0.0104,
        "t3.small" => 0.0208,
        "t3.medium" => 0.0416,
        "t3.large" => 0.0832,
        "t3.xlarge" => 0.1664,
        "t3.2xlarge" => 0.3328,
        "t4g.micro" => 0.0084,
        "t4g.small" => 0.0168,
        "t4g.medium" => 0.0336,
        "t4g.large" => 0.0672,
        "t4g.xlarge" => 0.1344,
        "t4g.2xlarge" => 0.2688,
        "c5.large" => 0.085,
        "c5.xlarge" => 0.17,
        "c5.2xlarge" => 0.34,
        "c5.4xlarge" => 0.68,
        "c5.9xlarge" => 1.53,
        "c6g.large" => 0.068,
        "c6g.xlarge" => 0.136,
        "c6g.2xlarge" => 0.272,
        "c6g.4xlarge" => 0.544,
        "c6g.8xlarge" => 1.088,
        "r5.large" => 0.126,
        "r5.xlarge" => 0.252,
        "r5.2xlarge" => 0.504,
        "r5.4xlarge" => 1.008,
        "r5.8xlarge" => 2.016,
        "r6g.large" => 0.1008,
        "r6g.xlarge" => 0.2016,
        "r6g.2xlarge" => 0.4032,
        "r6g.4xlarge" => 0.8064,
        "r6g.8xlarge" => 1.6128,
        "g4dn.large" => 0.263,
        "g4dn.xlarge" => 0.526,
        "g4dn.2xlarge" => 0.752,
        "g4dn.4xlarge" => 1.204,
        "g4dn.8xlarge" => 2.176,
        "g4dn.12xlarge" => 3.912,
        "g5g.large" => 0.21,
        "g5g.xlarge" => 0.42,
        "g5g.2xlarge" => 0.556,
        "g5g.4xlarge" => 0.828,
        "g5g.8xlarge" => 1.372,
        "g5g.16xlarge" => 2.744,
        "g5.xlarge" => 1.006,
        "p3.2xlarge" => 3.06,
        _ => return None,
    };
    Some(cost)
}

/// Hourly cost with the fallback applied.
pub fn estimate_cost(instance_type: &str) -> f64 {
    hourly_cost(instance_type).unwrap_or(FALLBACK_HOURLY_COST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PackageDefinitions;

    fn with_packages(system: &[&str], conda: &[&str]) -> Template {
        Template {
            name: "t".into(),
            packages: PackageDefinitions {
                system: system.iter().map(|s| s.to_string()).collect(),
                conda: conda.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_precedence() {
        assert_eq!(
            WorkloadClass::classify(&with_packages(&["openmpi"], &["pytorch"])),
            WorkloadClass::Gpu
        );
        assert_eq!(
            WorkloadClass::classify(&with_packages(&["libopenblas-dev"], &["r-base"])),
            WorkloadClass::HighMemory
        );
        assert_eq!(
            WorkloadClass::classify(&with_packages(&["libfftw3-dev"], &[])),
            WorkloadClass::HighCpu
        );
        assert_eq!(
            WorkloadClass::classify(&with_packages(&["git", "vim"], &[])),
            WorkloadClass::General
        );
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!("xl".parse::<InstanceSize>().unwrap(), InstanceSize::XL);
        assert_eq!("".parse::<InstanceSize>().unwrap(), InstanceSize::M);
        assert_eq!(InstanceSize::default(), InstanceSize::M);
        assert!("XXL".parse::<InstanceSize>().is_err());
    }

    #[test]
    fn test_ladder_selection() {
        assert_eq!(
            WorkloadClass::General.instance_type(Architecture::X86_64, InstanceSize::M),
            "t3.large"
        );
        assert_eq!(
            WorkloadClass::HighCpu.instance_type(Architecture::Arm64, InstanceSize::XL),
            "c6g.8xlarge"
        );
        let types = WorkloadClass::Gpu.instance_types(InstanceSize::XS);
        assert_eq!(types["x86_64"], "g4dn.large");
        assert_eq!(types["arm64"], "g5g.large");

        let gpu: Vec<&str> = InstanceSize::ALL
            .into_iter()
            .map(|size| WorkloadClass::Gpu.instance_type(Architecture::X86_64, size))
            .collect();
        assert_eq!(
            gpu,
            vec!["g4dn.large", "g4dn.xlarge", "g4dn.2xlarge", "g4dn.4xlarge", "g4dn.8xlarge"]
        );
        assert_eq!(
            WorkloadClass::Gpu.instance_type(Architecture::Arm64, InstanceSize::XL),
            "g5g.8xlarge"
        );
    }

    #[test]
    fn test_classify_ignores_case() {
        assert_eq!(
            WorkloadClass::classify(&with_packages(&[], &["PyTorch"])),
            WorkloadClass::Gpu
        );
        assert_eq!(
            WorkloadClass::classify(&with_packages(&["OpenMPI"], &[])),
            WorkloadClass::HighCpu
        );
    }

    #[test]
    fn test_every_ladder_entry_is_priced() {
        for class in [
            WorkloadClass::Gpu,
            WorkloadClass::HighMemory,
            WorkloadClass::HighCpu,
            WorkloadClass::General,
        ] {
            for arch in Architecture::ALL {
                for instance_type in class.ladder(arch) {
                    assert!(hourly_cost(instance_type).is_some(), "{}", instance_type);
                }
            }
        }
    }

    #[test]
    fn test_unknown_type_uses_fallback() {
        assert_eq!(estimate_cost("x9.mega"), FALLBACK_HOURLY_COST);
        assert!(estimate_cost("x9.mega") > 0.0);
    }
}
