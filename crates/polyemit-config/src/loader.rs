//! Project configuration loader
//!
//! Turns a project configuration file (tsconfig-style JSON) into a
//! normalized command line: the root file list, the merged compiler
//! options and the project references.

use crate::cache_key::IncrementalCacheKey;
use crate::options::{CompilerOptions, ProjectReference};
use crate::{normalize_path, ConfigError, ConfigResult};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Token expanded to the directory of the root configuration file
const CONFIG_DIR_TOKEN: &str = "${configDir}";

/// Options whose values are paths relative to the declaring file
const PATH_OPTIONS: &[&str] = &["outDir", "rootDir", "declarationDir", "tsBuildInfoFile"];

/// Source extensions picked up by `include` patterns
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts"];

/// Name used when a reference or `extends` points at a folder
pub const DEFAULT_CONFIG_NAME: &str = "tsconfig.json";

/// Loaded and normalized project configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    /// The configuration file this was loaded from
    pub config_path: PathBuf,

    /// Root files of the program, sorted
    pub files: Vec<PathBuf>,

    /// Merged compiler options with absolute path values
    pub options: CompilerOptions,

    /// Referenced projects, resolved to their configuration files
    pub project_references: Vec<ProjectReference>,
}

impl ParsedConfig {
    /// Directory containing the configuration file
    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// One file of an `extends` chain after path resolution
#[derive(Debug, Default)]
struct ConfigLayer {
    compiler_options: Map<String, Value>,
    files: Option<(PathBuf, Vec<String>)>,
    include: Option<(PathBuf, Vec<String>)>,
    exclude: Option<(PathBuf, Vec<String>)>,
}

/// Project configuration loader
///
/// Parsed JSON documents are cached per path so that repeated passes over
/// the same configuration (watch mode, solution builds) skip the disk.
pub struct ConfigLoader {
    json_cache: HashMap<PathBuf, Value>,
    incremental_cache: Option<(PathBuf, IncrementalCacheKey)>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            json_cache: HashMap::new(),
            incremental_cache: None,
        }
    }

    /// Redirect the build info of incremental projects into
    /// `metadata_folder`, named after `key`
    pub fn with_incremental_cache(mut self, metadata_folder: impl Into<PathBuf>, key: IncrementalCacheKey) -> Self {
        self.incremental_cache = Some((metadata_folder.into(), key));
        self
    }

    /// Drop every cached document
    pub fn invalidate(&mut self) {
        self.json_cache.clear();
    }

    /// Drop the cached document for one file
    pub fn invalidate_path(&mut self, path: &Path) {
        self.json_cache.remove(path);
    }

    /// Load a project configuration file
    pub fn load(&mut self, config_path: &Path) -> ConfigResult<ParsedConfig> {
        let config_path = normalize_path(config_path);
        let root_dir = config_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut chain = Vec::new();
        let layer = self.load_layer(&config_path, &root_dir, &mut chain)?;

        let mut options: CompilerOptions = serde_json::from_value(Value::Object(layer.compiler_options))
            .map_err(|e| ConfigError::JsonParseError {
                file: config_path.clone(),
                error: e.to_string(),
            })?;

        validate_options(&options)?;

        if options.is_incremental() {
            if let Some((folder, key)) = &self.incremental_cache {
                options.ts_build_info_file = Some(key.build_info_path(folder));
            }
        }

        let files = collect_root_files(&root_dir, &layer.files, &layer.include, &layer.exclude, &options)?;
        let project_references = self.read_references(&config_path, &root_dir)?;

        Ok(ParsedConfig {
            config_path,
            files,
            options,
            project_references,
        })
    }

    fn read_json(&mut self, path: &Path) -> ConfigResult<Value> {
        if let Some(cached) = self.json_cache.get(path) {
            return Ok(cached.clone());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let value: Value = serde_json::from_str(&to_strict_json(&content)).map_err(|e| {
            ConfigError::JsonParseError {
                file: path.to_path_buf(),
                error: e.to_string(),
            }
        })?;

        if !value.is_object() {
            return Err(ConfigError::ValidationError(format!(
                "{} must contain a JSON object",
                path.display()
            )));
        }

        self.json_cache.insert(path.to_path_buf(), value.clone());
        Ok(value)
    }

    /// Load one file and everything it extends; later layers win
    fn load_layer(&mut self, path: &Path, root_dir: &Path, chain: &mut Vec<PathBuf>) -> ConfigResult<ConfigLayer> {
        if chain.iter().any(|p| p == path) {
            chain.push(path.to_path_buf());
            let cycle = chain
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(ConfigError::ValidationError(format!(
                "Circular extends chain: {}",
                cycle
            )));
        }
        chain.push(path.to_path_buf());

        let document = self.read_json(path)?;
        let layer_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let mut merged = ConfigLayer::default();
        for parent in extends_targets(&document, &layer_dir)? {
            let parent_layer = self.load_layer(&parent, root_dir, chain)?;
            merge_layer(&mut merged, parent_layer);
        }

        let own = read_layer(&document, &layer_dir, root_dir, path)?;
        merge_layer(&mut merged, own);

        chain.pop();
        Ok(merged)
    }

    fn read_references(&mut self, config_path: &Path, root_dir: &Path) -> ConfigResult<Vec<ProjectReference>> {
        let document = self.read_json(config_path)?;
        let Some(references) = document.get("references") else {
            return Ok(Vec::new());
        };

        let references: Vec<ProjectReference> =
            serde_json::from_value(references.clone()).map_err(|e| ConfigError::JsonParseError {
                file: config_path.to_path_buf(),
                error: format!("invalid references: {}", e),
            })?;

        Ok(references
            .into_iter()
            .map(|reference| ProjectReference {
                path: resolve_config_file(&root_dir.join(&reference.path)),
                prepend: reference.prepend,
            })
            .collect())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate option combinations the compiler does not reject itself
fn validate_options(options: &CompilerOptions) -> ConfigResult<()> {
    if options.module.is_some() != options.out_dir.is_some() {
        return Err(ConfigError::ValidationError(
            "If either the module or the outDir option is provided in the compilerOptions, both must be provided"
                .to_string(),
        ));
    }
    Ok(())
}

/// Resolve `extends` into absolute config paths, in application order
fn extends_targets(document: &Value, layer_dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    let targets = match document.get("extends") {
        None => return Ok(Vec::new()),
        Some(Value::String(single)) => vec![single.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| ConfigError::InvalidValue {
                    field: "extends".to_string(),
                    reason: "entries must be strings".to_string(),
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?,
        Some(_) => {
            return Err(ConfigError::InvalidValue {
                field: "extends".to_string(),
                reason: "must be a string or an array of strings".to_string(),
            })
        }
    };

    Ok(targets
        .into_iter()
        .map(|target| {
            let path = layer_dir.join(&target);
            if path.is_dir() || target.ends_with(".json") {
                resolve_config_file(&path)
            } else {
                normalize_path(Path::new(&format!("{}.json", path.display())))
            }
        })
        .collect())
}

/// A reference may point at a folder holding the default config name
fn resolve_config_file(path: &Path) -> PathBuf {
    let path = normalize_path(path);
    if path.is_dir() {
        path.join(DEFAULT_CONFIG_NAME)
    } else {
        path
    }
}

fn read_layer(document: &Value, layer_dir: &Path, root_dir: &Path, path: &Path) -> ConfigResult<ConfigLayer> {
    let mut layer = ConfigLayer::default();

    if let Some(options) = document.get("compilerOptions") {
        let Value::Object(options) = options else {
            return Err(ConfigError::InvalidValue {
                field: "compilerOptions".to_string(),
                reason: format!("must be an object in {}", path.display()),
            });
        };

        for (key, value) in options {
            let value = match (PATH_OPTIONS.contains(&key.as_str()), value) {
                (true, Value::String(raw)) => {
                    Value::String(resolve_path_option(raw, layer_dir, root_dir).to_string_lossy().into_owned())
                }
                _ => value.clone(),
            };
            layer.compiler_options.insert(key.clone(), value);
        }
    }

    layer.files = string_list(document, "files", path)?.map(|list| (layer_dir.to_path_buf(), list));
    layer.include = string_list(document, "include", path)?.map(|list| (layer_dir.to_path_buf(), list));
    layer.exclude = string_list(document, "exclude", path)?.map(|list| (layer_dir.to_path_buf(), list));

    Ok(layer)
}

fn resolve_path_option(raw: &str, layer_dir: &Path, root_dir: &Path) -> PathBuf {
    if raw.contains(CONFIG_DIR_TOKEN) {
        let root = root_dir.to_string_lossy();
        normalize_path(Path::new(&raw.replacen(CONFIG_DIR_TOKEN, &root, 1)))
    } else {
        normalize_path(&layer_dir.join(raw))
    }
}

fn string_list(document: &Value, field: &str, path: &Path) -> ConfigResult<Option<Vec<String>>> {
    let Some(value) = document.get(field) else {
        return Ok(None);
    };

    let items = value.as_array().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("must be an array in {}", path.display()),
    })?;

    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                reason: "entries must be strings".to_string(),
            })
        })
        .collect::<ConfigResult<Vec<_>>>()
        .map(Some)
}

fn merge_layer(base: &mut ConfigLayer, overlay: ConfigLayer) {
    base.compiler_options.extend(overlay.compiler_options);
    if overlay.files.is_some() {
        base.files = overlay.files;
    }
    if overlay.include.is_some() {
        base.include = overlay.include;
    }
    if overlay.exclude.is_some() {
        base.exclude = overlay.exclude;
    }
}

fn collect_root_files(
    root_dir: &Path,
    files: &Option<(PathBuf, Vec<String>)>,
    include: &Option<(PathBuf, Vec<String>)>,
    exclude: &Option<(PathBuf, Vec<String>)>,
    options: &CompilerOptions,
) -> ConfigResult<Vec<PathBuf>> {
    let mut collected = BTreeSet::new();

    if let Some((base, names)) = files {
        for name in names {
            collected.insert(normalize_path(&base.join(name)));
        }
    }

    let default_include = (root_dir.to_path_buf(), vec!["**/*".to_string()]);
    let include = match (files, include) {
        (_, Some(include)) => Some(include),
        (None, None) => Some(&default_include),
        (Some(_), None) => None,
    };

    let mut excluded: Vec<(PathBuf, Option<String>)> = match exclude {
        Some((base, patterns)) => patterns
            .iter()
            .map(|p| {
                let (dir, _, extension) = pattern_base(base, p);
                (dir, extension)
            })
            .collect(),
        None => vec![(normalize_path(&root_dir.join("node_modules")), None)],
    };
    excluded.extend(options.out_dir.iter().map(|dir| (dir.clone(), None)));
    excluded.extend(options.declaration_dir.iter().map(|dir| (dir.clone(), None)));

    if let Some((base, patterns)) = include {
        for pattern in patterns {
            let (dir, recursive, extension) = pattern_base(base, pattern);
            if dir.is_file() {
                collected.insert(dir);
                continue;
            }
            if !dir.is_dir() {
                continue;
            }

            let walker = WalkDir::new(&dir).follow_links(false);
            let walker = if recursive { walker } else { walker.max_depth(1) };
            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = normalize_path(entry.path());
                let is_excluded = excluded.iter().any(|(dir, extension)| {
                    path.starts_with(dir) && extension.as_deref().map_or(true, |ext| is_source_file(&path, Some(ext)))
                });
                if is_excluded {
                    continue;
                }
                if is_source_file(&path, extension.as_deref()) {
                    collected.insert(path);
                }
            }
        }
    }

    Ok(collected.into_iter().collect())
}

/// Split an include/exclude pattern into its literal folder, whether it
/// recurses, and an optional required extension
fn pattern_base(base: &Path, pattern: &str) -> (PathBuf, bool, Option<String>) {
    let mut dir = base.to_path_buf();
    let mut recursive = false;
    let mut wildcard = false;
    let mut extension = None;

    for component in pattern.split('/') {
        if component == "**" {
            recursive = true;
            wildcard = true;
        } else if component.contains('*') {
            wildcard = true;
            extension = component.rsplit_once("*.").map(|(_, ext)| ext.to_string());
            break;
        } else if !wildcard && !component.is_empty() && component != "." {
            dir.push(component);
        }
    }

    // A bare folder name includes everything below it
    (normalize_path(&dir), recursive || !wildcard, extension)
}

fn is_source_file(path: &Path, required: Option<&str>) -> bool {
    let name = path.to_string_lossy();
    if let Some(required) = required {
        return name.ends_with(&format!(".{}", required));
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Strip `//` and `/* */` comments and trailing commas so serde_json
/// accepts the document
fn to_strict_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut without_comments = String::with_capacity(text.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            without_comments.push(c);
            if c == '\\' && i + 1 < chars.len() {
                without_comments.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (c, chars.get(i + 1)) {
            ('"', _) => {
                in_string = true;
                without_comments.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
            }
            _ => {
                without_comments.push(c);
                i += 1;
            }
        }
    }

    let chars: Vec<char> = without_comments.chars().collect();
    let mut strict = String::with_capacity(chars.len());
    in_string = false;
    for (index, &c) in chars.iter().enumerate() {
        if in_string {
            if c == '"' && chars[..index].iter().rev().take_while(|&&p| p == '\\').count() % 2 == 0 {
                in_string = false;
            }
            strict.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[index + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        strict.push(c);
    }
    strict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_json_strips_comments() {
        let text = r#"{
  // line comment
  "a": "http://not-a-comment", /* block */
  "b": [1, 2,],
}"#;
        let value: Value = serde_json::from_str(&to_strict_json(text)).unwrap();
        assert_eq!(value["a"], "http://not-a-comment");
        assert_eq!(value["b"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_strict_json_keeps_escaped_quotes() {
        let text = r#"{ "a": "say \"hi\", // ok" }"#;
        let value: Value = serde_json::from_str(&to_strict_json(text)).unwrap();
        assert_eq!(value["a"], "say \"hi\", // ok");
    }

    #[test]
    fn test_pattern_base() {
        let base = Path::new("/project");
        assert_eq!(
            pattern_base(base, "src/**/*"),
            (PathBuf::from("/project/src"), true, None)
        );
        assert_eq!(
            pattern_base(base, "src/*.ts"),
            (PathBuf::from("/project/src"), false, Some("ts".to_string()))
        );
        assert_eq!(
            pattern_base(base, "./lib"),
            (PathBuf::from("/project/lib"), true, None)
        );
    }

    #[test]
    fn test_config_dir_token() {
        let resolved = resolve_path_option("${configDir}/lib", Path::new("/base"), Path::new("/root"));
        assert_eq!(resolved, PathBuf::from("/root/lib"));
        let relative = resolve_path_option("../lib", Path::new("/base/config"), Path::new("/root"));
        assert_eq!(relative, PathBuf::from("/base/lib"));
    }

    #[test]
    fn test_module_without_out_dir_is_invalid() {
        let options = CompilerOptions {
            module: Some(crate::ModuleKind::CommonJs),
            ..Default::default()
        };
        assert!(matches!(
            validate_options(&options),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(validate_options(&CompilerOptions::default()).is_ok());
    }
}
