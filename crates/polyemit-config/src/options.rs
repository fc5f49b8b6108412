//! Compiler options shared by the loader, the planner and the compiler traits.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Output module format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    None,
    CommonJs,
    Amd,
    Umd,
    System,
    Es2015,
    Es2020,
    Es2022,
    EsNext,
    Node16,
    NodeNext,
    Preserve,
}

impl ModuleKind {
    /// Canonical spelling, as written in project configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::CommonJs => "CommonJS",
            Self::Amd => "AMD",
            Self::Umd => "UMD",
            Self::System => "System",
            Self::Es2015 => "ES2015",
            Self::Es2020 => "ES2020",
            Self::Es2022 => "ES2022",
            Self::EsNext => "ESNext",
            Self::Node16 => "Node16",
            Self::NodeNext => "NodeNext",
            Self::Preserve => "Preserve",
        }
    }

    /// Whether emitted files use `import`/`export` syntax
    pub fn is_es_module(&self) -> bool {
        matches!(
            self,
            Self::Es2015 | Self::Es2020 | Self::Es2022 | Self::EsNext | Self::Preserve
        )
    }

    /// Value of the `type` field of a package marker for this format
    pub fn package_type(&self) -> &'static str {
        if self.is_es_module() {
            "module"
        } else {
            "commonjs"
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> ConfigResult<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "commonjs" => Self::CommonJs,
            "amd" => Self::Amd,
            "umd" => Self::Umd,
            "system" => Self::System,
            "es6" | "es2015" => Self::Es2015,
            "es2020" => Self::Es2020,
            "es2022" => Self::Es2022,
            "esnext" => Self::EsNext,
            "node16" => Self::Node16,
            "nodenext" => Self::NodeNext,
            "preserve" => Self::Preserve,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "module".to_string(),
                    reason: format!("\"{}\" is not a valid module kind name", name),
                })
            }
        };
        Ok(kind)
    }
}

impl Serialize for ModuleKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ModuleKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Language level of emitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptTarget {
    Es3,
    Es5,
    Es2015,
    Es2016,
    Es2017,
    Es2018,
    Es2019,
    Es2020,
    Es2021,
    Es2022,
    Es2023,
    EsNext,
}

impl ScriptTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es3 => "ES3",
            Self::Es5 => "ES5",
            Self::Es2015 => "ES2015",
            Self::Es2016 => "ES2016",
            Self::Es2017 => "ES2017",
            Self::Es2018 => "ES2018",
            Self::Es2019 => "ES2019",
            Self::Es2020 => "ES2020",
            Self::Es2021 => "ES2021",
            Self::Es2022 => "ES2022",
            Self::Es2023 => "ES2023",
            Self::EsNext => "ESNext",
        }
    }
}

impl FromStr for ScriptTarget {
    type Err = ConfigError;

    fn from_str(name: &str) -> ConfigResult<Self> {
        let target = match name.to_ascii_lowercase().as_str() {
            "es3" => Self::Es3,
            "es5" => Self::Es5,
            "es6" | "es2015" => Self::Es2015,
            "es2016" => Self::Es2016,
            "es2017" => Self::Es2017,
            "es2018" => Self::Es2018,
            "es2019" => Self::Es2019,
            "es2020" => Self::Es2020,
            "es2021" => Self::Es2021,
            "es2022" => Self::Es2022,
            "es2023" => Self::Es2023,
            "esnext" | "latest" => Self::EsNext,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "target".to_string(),
                    reason: format!("\"{}\" is not a valid script target", name),
                })
            }
        };
        Ok(target)
    }
}

impl Serialize for ScriptTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ScriptTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Extension written for emitted JavaScript files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JsExtension {
    Js,
    Cjs,
    Mjs,
}

impl JsExtension {
    /// The extension including its leading dot
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Js => ".js",
            Self::Cjs => ".cjs",
            Self::Mjs => ".mjs",
        }
    }
}

impl fmt::Display for JsExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JsExtension {
    type Err = ConfigError;

    fn from_str(value: &str) -> ConfigResult<Self> {
        match value.trim_start_matches('.') {
            "js" => Ok(Self::Js),
            "cjs" => Ok(Self::Cjs),
            "mjs" => Ok(Self::Mjs),
            _ => Err(ConfigError::InvalidValue {
                field: "extension_override".to_string(),
                reason: format!("unsupported extension '{}'", value),
            }),
        }
    }
}

impl Serialize for JsExtension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JsExtension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to another project configuration (composite builds)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectReference {
    /// Path to the referenced config file or its folder
    pub path: PathBuf,

    /// Prepend the referenced project's output (legacy `outFile` builds)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prepend: bool,
}

/// Normalized compiler options
///
/// Unknown options are preserved in `extra` so the compiler can read
/// settings this crate does not model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ScriptTarget>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub declaration_dir: Option<PathBuf>,

    pub declaration: bool,
    pub declaration_map: bool,
    pub emit_declaration_only: bool,
    pub source_map: bool,
    pub inline_source_map: bool,
    pub no_emit: bool,
    pub incremental: bool,
    pub composite: bool,
    pub isolated_modules: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_build_info_file: Option<PathBuf>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CompilerOptions {
    /// Incremental state is kept for composite projects as well
    pub fn is_incremental(&self) -> bool {
        self.incremental || self.composite
    }
}
