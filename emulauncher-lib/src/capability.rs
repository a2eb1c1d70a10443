//! Host GPU/CPU capability detection
//!
//! Detection is best-effort: identification strings are read from a few
//! host-exposed files and matched against rule tables. Nothing here returns
//! an error; unreadable or unrecognized sources degrade to `Unknown` / `0`,
//! which selects the most compatible configuration downstream.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};

/// GPU family, as far as graphics backend selection cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuFamily {
    Adreno,
    Mali,
    #[default]
    Unknown,
}

impl GpuFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuFamily::Adreno => "adreno",
            GpuFamily::Mali => "mali",
            GpuFamily::Unknown => "unknown",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self, GpuFamily::Unknown)
    }
}

impl fmt::Display for GpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected host capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct DeviceCapability {
    pub gpu: GpuFamily,
    /// Coarse CPU generation: 0 unknown, 1 ARMv8.0, 2 ARMv8.2, 3 ARMv9.0, 4 ARMv9.2
    pub cpu_generation: u8,
}

impl DeviceCapability {
    pub fn new(gpu: GpuFamily, cpu_generation: u8) -> Self {
        Self { gpu, cpu_generation }
    }

    /// Safest configuration: software rendering, no CPU assumptions
    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Identification sources probed on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    CpuInfo,
    KgslGpuModel,
    KernelGpuModel,
    DeviceTreeModel,
}

impl Probe {
    pub const GPU_PROBES: [Probe; 4] = [
        Probe::KgslGpuModel,
        Probe::KernelGpuModel,
        Probe::DeviceTreeModel,
        Probe::CpuInfo,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Probe::CpuInfo => "/proc/cpuinfo",
            Probe::KgslGpuModel => "/sys/class/kgsl/kgsl-3d0/gpu_model",
            Probe::KernelGpuModel => "/sys/kernel/gpu/gpu_model",
            Probe::DeviceTreeModel => "/proc/device-tree/model",
        }
    }
}

/// Where identification strings come from
pub trait CapabilitySource: Send + Sync {
    fn read(&self, probe: Probe) -> io::Result<String>;
}

/// Reads the real host files, optionally below a different root (for chroots/tests)
#[derive(Debug, Clone, Default)]
pub struct HostCapabilitySource {
    root: Option<PathBuf>,
}

impl HostCapabilitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, probe: Probe) -> PathBuf {
        match self.root {
            Some(ref root) => root.join(probe.path().trim_start_matches('/')),
            None => PathBuf::from(probe.path()),
        }
    }
}

impl CapabilitySource for HostCapabilitySource {
    fn read(&self, probe: Probe) -> io::Result<String> {
        let bytes = std::fs::read(self.resolve(probe))?;
        // device-tree strings are NUL terminated
        Ok(String::from_utf8_lossy(&bytes)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string())
    }
}

struct GpuRule {
    pattern: Regex,
    family: GpuFamily,
}

/// First match wins. Xclipse (RDNA) ships in Exynos parts and must not be taken for Mali.
const GPU_RULES: &[(&str, GpuFamily)] = &[
    (r"(?i)\bxclipse\b", GpuFamily::Unknown),
    (r"(?i)\badreno", GpuFamily::Adreno),
    (r"(?i)\bmali\b", GpuFamily::Mali),
    (
        r"(?i)\b(qcom|qualcomm|snapdragon|sm\d{4}|msm\d{4}|sdm\d{3}|kona|lahaina|taro|kalama|pineapple)\b",
        GpuFamily::Adreno,
    ),
    (
        r"(?i)\b(exynos\d*|mediatek|mt\d{4}|dimensity|helio|kirin\d*|tensor|gs\d{3})\b",
        GpuFamily::Mali,
    ),
];

fn gpu_rules() -> &'static [GpuRule] {
    static RULES: OnceLock<Vec<GpuRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        GPU_RULES
            .iter()
            .filter_map(|(pattern, family)| {
                Regex::new(pattern).ok().map(|pattern| GpuRule {
                    pattern,
                    family: *family,
                })
            })
            .collect()
    })
}

/// Classify one identification string
pub fn classify_gpu(identification: &str) -> Option<GpuFamily> {
    gpu_rules()
        .iter()
        .find(|rule| rule.pattern.is_match(identification))
        .map(|rule| rule.family)
}

/// ARM `CPU part` numbers mapped to a coarse generation
const CPU_PARTS: &[(u32, u8)] = &[
    (0xd03, 1), // Cortex-A53
    (0xd07, 1), // Cortex-A57
    (0xd08, 1), // Cortex-A72
    (0xd09, 1), // Cortex-A73
    (0xd05, 2), // Cortex-A55
    (0xd0a, 2), // Cortex-A75
    (0xd0b, 2), // Cortex-A76
    (0xd0d, 2), // Cortex-A77
    (0xd41, 2), // Cortex-A78
    (0xd44, 2), // Cortex-X1
    (0xd46, 3), // Cortex-A510
    (0xd47, 3), // Cortex-A710
    (0xd48, 3), // Cortex-X2
    (0xd4d, 3), // Cortex-A715
    (0xd4e, 3), // Cortex-X3
    (0xd80, 4), // Cortex-A520
    (0xd81, 4), // Cortex-A720
    (0xd82, 4), // Cortex-X4
];

pub fn classify_cpu_part(part: u32) -> Option<u8> {
    CPU_PARTS
        .iter()
        .find(|(known, _)| *known == part)
        .map(|(_, generation)| *generation)
}

/// Generation from a /proc/cpuinfo dump: best known core, else the feature flags
pub fn classify_cpuinfo(cpuinfo: &str) -> u8 {
    let mut by_part = None;
    let mut by_features = 0u8;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        if key.eq_ignore_ascii_case("CPU part") {
            let digits = value.trim_start_matches("0x").trim_start_matches("0X");
            if let Some(generation) = u32::from_str_radix(digits, 16)
                .ok()
                .and_then(classify_cpu_part)
            {
                by_part = by_part.max(Some(generation));
            }
        } else if key.eq_ignore_ascii_case("Features") {
            let flags: Vec<&str> = value.split_whitespace().collect();
            let generation = if flags.contains(&"sve2") {
                3
            } else if flags.contains(&"atomics") {
                2
            } else if flags.contains(&"asimd") {
                1
            } else {
                0
            };
            by_features = by_features.max(generation);
        }
    }

    by_part.unwrap_or(by_features)
}

/// Detect the GPU family; never fails
pub fn detect_gpu(source: &dyn CapabilitySource) -> GpuFamily {
    for probe in Probe::GPU_PROBES {
        match source.read(probe) {
            Ok(content) => {
                if let Some(family) = classify_gpu(&content) {
                    debug!("GPU classified as {} from {}", family, probe.path());
                    return family;
                }
            }
            Err(e) => debug!("Capability probe {} unavailable: {}", probe.path(), e),
        }
    }
    GpuFamily::Unknown
}

/// Detect the CPU generation; never fails
pub fn detect_cpu_generation(source: &dyn CapabilitySource) -> u8 {
    match source.read(Probe::CpuInfo) {
        Ok(cpuinfo) => classify_cpuinfo(&cpuinfo),
        Err(e) => {
            debug!("Capability probe {} unavailable: {}", Probe::CpuInfo.path(), e);
            0
        }
    }
}

pub fn detect(source: &dyn CapabilitySource) -> DeviceCapability {
    let capability = DeviceCapability::new(detect_gpu(source), detect_cpu_generation(source));
    info!(
        "Detected GPU family: {}, CPU generation: {}",
        capability.gpu, capability.cpu_generation
    );
    capability
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    struct FakeSource(HashMap<&'static str, &'static str>);

    impl CapabilitySource for FakeSource {
        fn read(&self, probe: Probe) -> io::Result<String> {
            self.0
                .get(probe.path())
                .map(|s| s.to_string())
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }
    }

    #[rstest]
    #[case("Adreno740v2", Some(GpuFamily::Adreno))]
    #[case("Adreno (TM) 650", Some(GpuFamily::Adreno))]
    #[case("Mali-G78", Some(GpuFamily::Mali))]
    #[case("Qualcomm Technologies, Inc SM8550", Some(GpuFamily::Adreno))]
    #[case("Hardware\t: Qualcomm Technologies, Inc KONA", Some(GpuFamily::Adreno))]
    #[case("MT6893", Some(GpuFamily::Mali))]
    #[case("Samsung Exynos 2200 Xclipse 920", Some(GpuFamily::Unknown))]
    #[case("Google Tensor G2", Some(GpuFamily::Mali))]
    #[case("PowerVR Rogue GE8320", None)]
    #[case("", None)]
    fn classify_gpu_table(#[case] identification: &str, #[case] expected: Option<GpuFamily>) {
        assert_eq!(classify_gpu(identification), expected);
    }

    #[rstest]
    #[case(0xd03, Some(1))]
    #[case(0xd41, Some(2))]
    #[case(0xd47, Some(3))]
    #[case(0xd82, Some(4))]
    #[case(0x001, None)]
    fn classify_cpu_part_table(#[case] part: u32, #[case] expected: Option<u8>) {
        assert_eq!(classify_cpu_part(part), expected);
    }

    #[test]
    fn cpuinfo_uses_best_core() {
        let cpuinfo = "processor\t: 0\nFeatures\t: fp asimd atomics\nCPU part\t: 0xd05\n\n\
                       processor\t: 7\nFeatures\t: fp asimd atomics\nCPU part\t: 0xd44\n";
        assert_eq!(classify_cpuinfo(cpuinfo), 2);

        let big_little = "CPU part\t: 0xd46\nCPU part\t: 0xd4e\nCPU part\t: 0xd03\n";
        assert_eq!(classify_cpuinfo(big_little), 3);
    }

    #[test]
    fn cpuinfo_falls_back_to_features() {
        assert_eq!(classify_cpuinfo("Features\t: fp asimd evtstrm sve2\nCPU part\t: 0xfff\n"), 3);
        assert_eq!(classify_cpuinfo("Features\t: fp asimd\n"), 1);
        assert_eq!(classify_cpuinfo("garbage without separators"), 0);
    }

    #[test]
    fn unreadable_sources_degrade_to_unknown() {
        let source = FakeSource(HashMap::new());
        assert_eq!(detect_gpu(&source), GpuFamily::Unknown);
        assert_eq!(detect_cpu_generation(&source), 0);
        assert_eq!(detect(&source), DeviceCapability::unknown());
    }

    #[test]
    fn dedicated_gpu_model_wins_over_cpuinfo() {
        let source = FakeSource(HashMap::from([
            ("/sys/kernel/gpu/gpu_model", "Mali-G710"),
            ("/proc/cpuinfo", "Hardware\t: Qualcomm\nCPU part\t: 0xd47\n"),
        ]));
        assert_eq!(detect(&source), DeviceCapability::new(GpuFamily::Mali, 3));
    }

    #[test]
    fn host_source_reads_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let kgsl = dir.path().join("sys/class/kgsl/kgsl-3d0");
        std::fs::create_dir_all(&kgsl).unwrap();
        std::fs::write(kgsl.join("gpu_model"), "Adreno730v2\n").unwrap();

        let source = HostCapabilitySource::with_root(dir.path());
        assert_eq!(source.read(Probe::KgslGpuModel).unwrap(), "Adreno730v2");
        assert_eq!(detect_gpu(&source), GpuFamily::Adreno);
        assert_eq!(detect_cpu_generation(&source), 0);
    }
}
