//! Environment composition for the translation layer and compatibility runtime
//!
//! A launch environment is built in layers, later layers winning:
//! translation layer base, preset recompiler bundle, graphics backend for the
//! detected GPU family, compatibility runtime settings, container overrides.

use crate::capability::{DeviceCapability, GpuFamily};
use crate::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Asynchronous shader compilation toggle; always emitted
pub const ASYNC_SHADER_KEY: &str = "DXVK_ASYNC";

/// Shader state cache location, relative to the container working directory
pub const STATE_CACHE_KEY: &str = "DXVK_STATE_CACHE_PATH";
pub const DEFAULT_STATE_CACHE: &str = "shader-cache";

/// Named bundle of tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PerformancePreset {
    MaximumPerformance,
    #[default]
    Balanced,
    MaximumStability,
}

impl PerformancePreset {
    pub fn all() -> [PerformancePreset; 3] {
        [
            PerformancePreset::MaximumPerformance,
            PerformancePreset::Balanced,
            PerformancePreset::MaximumStability,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PerformancePreset::MaximumPerformance => "maximum_performance",
            PerformancePreset::Balanced => "balanced",
            PerformancePreset::MaximumStability => "maximum_stability",
        }
    }

    pub fn bundle(&self) -> &'static PresetBundle {
        match self {
            PerformancePreset::MaximumPerformance => &MAXIMUM_PERFORMANCE,
            PerformancePreset::Balanced => &BALANCED,
            PerformancePreset::MaximumStability => &MAXIMUM_STABILITY,
        }
    }
}

impl FromStr for PerformancePreset {
    type Err = EmulatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "maximum_performance" | "performance" => Ok(PerformancePreset::MaximumPerformance),
            "balanced" => Ok(PerformancePreset::Balanced),
            "maximum_stability" | "stability" => Ok(PerformancePreset::MaximumStability),
            _ => Err(EmulatorError::Config(format!("Unknown preset: {}", s))),
        }
    }
}

impl fmt::Display for PerformancePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recompiler and runtime values of one preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetBundle {
    /// Flag computation strictness (0 fastest, 2 safest)
    pub safe_flags: u8,
    pub fast_nan: bool,
    pub fast_round: bool,
    pub x87_double: bool,
    /// Block size (0 smallest .. 3 largest)
    pub big_block: u8,
    /// Memory-ordering strictness (0 relaxed .. 2 strongest)
    pub strong_mem: u8,
    /// Forward-branch lookahead distance in bytes
    pub forward: u16,
    /// Call/return optimization
    pub call_ret: bool,
    pub wait: bool,
    pub async_shaders: bool,
    pub esync: bool,
}

const MAXIMUM_PERFORMANCE: PresetBundle = PresetBundle {
    safe_flags: 1,
    fast_nan: true,
    fast_round: true,
    x87_double: false,
    big_block: 3,
    strong_mem: 0,
    forward: 512,
    call_ret: true,
    wait: true,
    async_shaders: true,
    esync: true,
};

const BALANCED: PresetBundle = PresetBundle {
    safe_flags: 2,
    fast_nan: true,
    fast_round: false,
    x87_double: true,
    big_block: 1,
    strong_mem: 0,
    forward: 128,
    call_ret: false,
    wait: true,
    async_shaders: true,
    esync: true,
};

const MAXIMUM_STABILITY: PresetBundle = PresetBundle {
    safe_flags: 2,
    fast_nan: false,
    fast_round: false,
    x87_double: true,
    big_block: 0,
    strong_mem: 2,
    forward: 128,
    call_ret: false,
    wait: false,
    async_shaders: false,
    esync: false,
};

fn flag(value: bool) -> String {
    let flag = if value { "1" } else { "0" };
    flag.to_string()
}

impl PresetBundle {
    fn apply(&self, vars: &mut BTreeMap<String, String>) {
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };
        set("BOX64_DYNAREC_SAFEFLAGS", self.safe_flags.to_string());
        set("BOX64_DYNAREC_FASTNAN", flag(self.fast_nan));
        set("BOX64_DYNAREC_FASTROUND", flag(self.fast_round));
        set("BOX64_DYNAREC_X87DOUBLE", flag(self.x87_double));
        set("BOX64_DYNAREC_BIGBLOCK", self.big_block.to_string());
        set("BOX64_DYNAREC_STRONGMEM", self.strong_mem.to_string());
        set("BOX64_DYNAREC_FORWARD", self.forward.to_string());
        set("BOX64_DYNAREC_CALLRET", flag(self.call_ret));
        set("BOX64_DYNAREC_WAIT", flag(self.wait));
    }
}

/// Knobs that are not part of a preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeOptions {
    /// 32-bit guests run through the 64-bit runtime
    pub wow64: bool,
    pub translation_logs: bool,
    /// WINEDEBUG value; `-all` when unset
    pub runtime_debug: Option<String>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            wow64: true,
            translation_logs: false,
            runtime_debug: None,
        }
    }
}

/// Immutable, deterministic environment variable map
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EnvironmentVariableSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentVariableSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// New set with `extra` layered on top
    pub fn merged(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut vars = self.vars.clone();
        vars.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { vars }
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.vars
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentVariableSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<'a> IntoIterator for &'a EnvironmentVariableSet {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

impl fmt::Display for EnvironmentVariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.vars {
            writeln!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Compose with default options
pub fn compose(
    preset: PerformancePreset,
    capability: &DeviceCapability,
    container_overrides: &BTreeMap<String, String>,
) -> EnvironmentVariableSet {
    compose_with(preset, capability, container_overrides, &ComposeOptions::default())
}

pub fn compose_with(
    preset: PerformancePreset,
    capability: &DeviceCapability,
    container_overrides: &BTreeMap<String, String>,
    options: &ComposeOptions,
) -> EnvironmentVariableSet {
    let mut vars = BTreeMap::new();

    add_translation_base(&mut vars, options);
    preset.bundle().apply(&mut vars);
    add_graphics_backend(&mut vars, capability.gpu);
    add_runtime_settings(&mut vars, preset.bundle(), options);

    for (key, value) in container_overrides {
        vars.insert(key.clone(), value.clone());
    }

    EnvironmentVariableSet { vars }
}

fn insert(vars: &mut BTreeMap<String, String>, key: &str, value: &str) {
    vars.insert(key.to_string(), value.to_string());
}

fn add_translation_base(vars: &mut BTreeMap<String, String>, options: &ComposeOptions) {
    insert(vars, "BOX64_NOBANNER", if options.translation_logs { "0" } else { "1" });
    insert(vars, "BOX64_DYNAREC", "1");
    insert(vars, "BOX64_AVX", "1");
    insert(vars, "BOX64_NORCFILES", "1");
    insert(vars, "BOX64_X11GLX", "1");
    if options.wow64 {
        insert(vars, "BOX64_MMAP32", "1");
    }
    if options.translation_logs {
        insert(vars, "BOX64_LOG", "1");
        insert(vars, "BOX64_DYNAREC_MISSING", "1");
    }
}

fn add_graphics_backend(vars: &mut BTreeMap<String, String>, gpu: GpuFamily) {
    match gpu {
        GpuFamily::Adreno => {
            // Turnip Vulkan driver under zink
            insert(vars, "GALLIUM_DRIVER", "zink");
            insert(vars, "MESA_LOADER_DRIVER_OVERRIDE", "zink");
            insert(vars, "TU_DEBUG", "noconform");
            insert(vars, "WINE_D3D_CONFIG", "renderer=vulkan");
            insert(vars, "LIBGL_ALWAYS_INDIRECT", "0");
            insert(vars, "LIBGL_ALWAYS_SOFTWARE", "0");
        }
        GpuFamily::Mali => {
            insert(vars, "GALLIUM_DRIVER", "zink");
            insert(vars, "MESA_LOADER_DRIVER_OVERRIDE", "zink");
            insert(vars, "ZINK_DESCRIPTORS", "lazy");
            insert(vars, "WINE_D3D_CONFIG", "renderer=vulkan");
            insert(vars, "LIBGL_ALWAYS_INDIRECT", "0");
            insert(vars, "LIBGL_ALWAYS_SOFTWARE", "0");
        }
        GpuFamily::Unknown => {
            insert(vars, "GALLIUM_DRIVER", "llvmpipe");
            insert(vars, "LIBGL_ALWAYS_SOFTWARE", "1");
            insert(vars, "LIBGL_ALWAYS_INDIRECT", "1");
            insert(vars, "WINE_D3D_CONFIG", "renderer=gl");
        }
    }
}

fn add_runtime_settings(
    vars: &mut BTreeMap<String, String>,
    bundle: &PresetBundle,
    options: &ComposeOptions,
) {
    insert(vars, "WINEDEBUG", options.runtime_debug.as_deref().unwrap_or("-all"));
    insert(vars, "WINEESYNC", if bundle.esync { "1" } else { "0" });
    insert(vars, "DXVK_LOG_LEVEL", "none");
    insert(vars, STATE_CACHE_KEY, DEFAULT_STATE_CACHE);
    // Explicit in both directions so switching presets never inherits a stale value
    insert(vars, ASYNC_SHADER_KEY, if bundle.async_shaders { "1" } else { "0" });
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse one `KEY=VALUE` override
pub fn parse_override(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if is_valid_key(key) => Ok((key.to_string(), value.to_string())),
        _ => Err(EmulatorError::Config(format!(
            "Invalid environment override: {:?}",
            pair
        ))),
    }
}

/// Parse whitespace separated overrides (`WINEESYNC=0 DXVK_HUD=fps`)
pub fn parse_overrides(input: &str) -> Result<BTreeMap<String, String>> {
    input.split_whitespace().map(parse_override).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn adreno() -> DeviceCapability {
        DeviceCapability::new(GpuFamily::Adreno, 3)
    }

    #[rstest]
    fn compose_is_deterministic(
        #[values(
            PerformancePreset::MaximumPerformance,
            PerformancePreset::Balanced,
            PerformancePreset::MaximumStability
        )]
        preset: PerformancePreset,
        #[values(GpuFamily::Adreno, GpuFamily::Mali, GpuFamily::Unknown)] gpu: GpuFamily,
    ) {
        let capability = DeviceCapability::new(gpu, 2);
        let first = compose(preset, &capability, &BTreeMap::new());
        let second = compose(preset, &capability, &BTreeMap::new());
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[rstest]
    #[case(PerformancePreset::MaximumPerformance, "1")]
    #[case(PerformancePreset::Balanced, "1")]
    #[case(PerformancePreset::MaximumStability, "0")]
    fn async_shader_key_always_present(#[case] preset: PerformancePreset, #[case] expected: &str) {
        for gpu in [GpuFamily::Adreno, GpuFamily::Mali, GpuFamily::Unknown] {
            let env = compose(preset, &DeviceCapability::new(gpu, 0), &BTreeMap::new());
            assert_eq!(env.get(ASYNC_SHADER_KEY), Some(expected));
        }
    }

    #[test]
    fn unknown_gpu_selects_software_fallback() {
        let env = compose(
            PerformancePreset::Balanced,
            &DeviceCapability::unknown(),
            &BTreeMap::new(),
        );
        assert_eq!(env.get("GALLIUM_DRIVER"), Some("llvmpipe"));
        assert_eq!(env.get("LIBGL_ALWAYS_SOFTWARE"), Some("1"));
        assert_eq!(env.get("LIBGL_ALWAYS_INDIRECT"), Some("1"));
        assert_eq!(env.get("WINE_D3D_CONFIG"), Some("renderer=gl"));
        assert!(!env.contains_key("MESA_LOADER_DRIVER_OVERRIDE"));
    }

    #[test]
    fn accelerated_gpu_uses_direct_rendering() {
        let env = compose(PerformancePreset::Balanced, &adreno(), &BTreeMap::new());
        assert_eq!(env.get("GALLIUM_DRIVER"), Some("zink"));
        assert_eq!(env.get("TU_DEBUG"), Some("noconform"));
        assert_eq!(env.get("LIBGL_ALWAYS_INDIRECT"), Some("0"));
        assert_eq!(env.get("WINE_D3D_CONFIG"), Some("renderer=vulkan"));

        let mali = compose(
            PerformancePreset::Balanced,
            &DeviceCapability::new(GpuFamily::Mali, 2),
            &BTreeMap::new(),
        );
        assert_eq!(mali.get("ZINK_DESCRIPTORS"), Some("lazy"));
        assert!(!mali.contains_key("TU_DEBUG"));
    }

    #[test]
    fn preset_bundles_differ_in_recompiler_flags() {
        let fast = compose(PerformancePreset::MaximumPerformance, &adreno(), &BTreeMap::new());
        let safe = compose(PerformancePreset::MaximumStability, &adreno(), &BTreeMap::new());

        assert_eq!(fast.get("BOX64_DYNAREC_BIGBLOCK"), Some("3"));
        assert_eq!(fast.get("BOX64_DYNAREC_CALLRET"), Some("1"));
        assert_eq!(fast.get("BOX64_DYNAREC_FORWARD"), Some("512"));
        assert_eq!(safe.get("BOX64_DYNAREC_STRONGMEM"), Some("2"));
        assert_eq!(safe.get("BOX64_DYNAREC_BIGBLOCK"), Some("0"));
        assert_eq!(safe.get("WINEESYNC"), Some("0"));
    }

    #[test]
    fn container_overrides_win() {
        let overrides = parse_overrides("DXVK_ASYNC=0 WINEDEBUG=+seh GALLIUM_DRIVER=virpipe").unwrap();
        let env = compose(PerformancePreset::MaximumPerformance, &adreno(), &overrides);
        assert_eq!(env.get(ASYNC_SHADER_KEY), Some("0"));
        assert_eq!(env.get("WINEDEBUG"), Some("+seh"));
        assert_eq!(env.get("GALLIUM_DRIVER"), Some("virpipe"));
    }

    #[test]
    fn options_control_logging_and_wow64() {
        let options = ComposeOptions {
            wow64: false,
            translation_logs: true,
            runtime_debug: Some("+loaddll".into()),
        };
        let env = compose_with(PerformancePreset::Balanced, &adreno(), &BTreeMap::new(), &options);
        assert_eq!(env.get("BOX64_LOG"), Some("1"));
        assert_eq!(env.get("BOX64_NOBANNER"), Some("0"));
        assert_eq!(env.get("WINEDEBUG"), Some("+loaddll"));
        assert!(!env.contains_key("BOX64_MMAP32"));
    }

    #[rstest]
    #[case("balanced", PerformancePreset::Balanced)]
    #[case("maximum-performance", PerformancePreset::MaximumPerformance)]
    #[case("performance", PerformancePreset::MaximumPerformance)]
    #[case("MAXIMUM_STABILITY", PerformancePreset::MaximumStability)]
    fn preset_from_str(#[case] name: &str, #[case] expected: PerformancePreset) {
        assert_eq!(name.parse::<PerformancePreset>().unwrap(), expected);
        assert_eq!(expected.as_str().parse::<PerformancePreset>().unwrap(), expected);
    }

    #[rstest]
    #[case("NOEQUALS")]
    #[case("=value")]
    #[case("1KEY=value")]
    #[case("BAD-KEY=value")]
    fn parse_override_rejects_malformed(#[case] pair: &str) {
        assert!(parse_override(pair).is_err());
    }

    #[test]
    fn parse_override_keeps_equals_in_value() {
        assert_eq!(
            parse_override("WINE_D3D_CONFIG=renderer=vulkan").unwrap(),
            ("WINE_D3D_CONFIG".to_string(), "renderer=vulkan".to_string())
        );
        assert!(parse_overrides("").unwrap().is_empty());
    }
}
