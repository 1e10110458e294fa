//! Configuration loading from `~/.agentbus/config.toml` with defaults.
//!
//! The `include` field lists further TOML files, relative to the including
//! file, that are deep-merged underneath it (the including file wins).

use agentbus_types::config::BusConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load the bus configuration from a TOML file, with defaults.
///
/// Never fails: unreadable, malformed or mistyped files fall back to
/// [`BusConfig::default`] after logging why.
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return BusConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return BusConfig::default();
        }
    };

    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return BusConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));

    if let Err(e) = resolve_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<BusConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize merged config, using defaults");
            BusConfig::default()
        }
    }
}

/// Merge the files listed in `include` underneath `root_value`.
///
/// Includes must be relative, may not contain `..`, may not leave the
/// config directory and may not form a cycle.
fn resolve_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include}' cannot be resolved: {e}"))?;
        let canonical_dir = std::fs::canonicalize(config_dir)
            .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("Config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include}': {e}"))?;
        let mut value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_includes(&mut value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged, &value);
    }

    let mut root = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged, &root);
    *root_value = merged;
    Ok(())
}

/// Deep-merge two TOML values. `overlay` values override `base` values.
/// For tables, recursively merge. For everything else, overlay wins.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    agentbus_home().join("config.toml")
}

/// Get the agentbus home directory (`~/.agentbus`).
pub fn agentbus_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentbus")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, lines: &[&str]) {
        let mut f = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.network.port, agentbus_types::config::DEFAULT_PORT);
    }

    #[test]
    fn test_load_config_sections() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write_file(
            &root,
            &[
                "peer_name = \"station-1\"",
                "outputs_request = true",
                "[network]",
                "port = 5999",
                "unbounded_queue = true",
                "[network.headers]",
                "site = \"lab\"",
                "[monitor]",
                "period_ms = 500",
            ],
        );

        let config = load_config(Some(&root));
        assert_eq!(config.peer_name.as_deref(), Some("station-1"));
        assert!(config.outputs_request);
        assert_eq!(config.network.port, 5999);
        assert!(config.network.unbounded_queue);
        assert_eq!(config.network.headers["site"], "lab");
        assert_eq!(config.monitor.period_ms, Some(500));
        assert!(config.constraints_enforce);
    }

    #[test]
    fn test_load_config_bad_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write_file(&root, &["[network", "port = "]);
        assert_eq!(load_config(Some(&root)).network.port, 5670);
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value = toml::from_str(
            r#"
            log_level = "debug"
            [network]
            port = 6000
            peer_timeout_ms = 1000
        "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [network]
            port = 7000
        "#,
        )
        .unwrap();
        deep_merge_toml(&mut base, &overlay);
        assert_eq!(base["log_level"].as_str(), Some("debug"));
        let net = base["network"].as_table().unwrap();
        assert_eq!(net["port"].as_integer(), Some(7000));
        assert_eq!(net["peer_timeout_ms"].as_integer(), Some(1000));
    }

    #[test]
    fn test_basic_include() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("base.toml"),
            &["log_level = \"debug\"", "[network]", "port = 6100"],
        );
        let root = dir.path().join("config.toml");
        write_file(&root, &["include = [\"base.toml\"]", "log_level = \"warn\""]);

        let config = load_config(Some(&root));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.network.port, 6100);
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join("grandchild.toml"),
            &["log_level = \"trace\"", "peer_name = \"deep\""],
        );
        write_file(
            &dir.path().join("child.toml"),
            &["include = [\"grandchild.toml\"]", "log_level = \"debug\""],
        );
        let root = dir.path().join("config.toml");
        write_file(&root, &["include = [\"child.toml\"]", "log_level = \"info\""]);

        let config = load_config(Some(&root));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.peer_name.as_deref(), Some("deep"));
    }

    #[test]
    fn test_circular_include_detected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        write_file(&a, &["include = [\"b.toml\"]", "log_level = \"warn\""]);
        write_file(&dir.path().join("b.toml"), &["include = [\"a.toml\"]"]);

        // The cycle is reported and the root file is used on its own.
        let config = load_config(Some(&a));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_path_traversal_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write_file(&root, &["include = [\"../etc/passwd\"]"]);
        assert_eq!(load_config(Some(&root)).log_level, "info");
    }

    #[test]
    fn test_absolute_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write_file(&root, &["include = [\"/etc/shadow\"]"]);
        assert_eq!(load_config(Some(&root)).log_level, "info");
    }

    #[test]
    fn test_max_depth_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let path = dir.path().join(format!("level{i}.toml"));
            let include = format!("include = [\"level{}.toml\"]", i + 1);
            let level = format!("log_level = \"level{i}\"");
            if i < 11 {
                write_file(&path, &[&include, &level]);
            } else {
                write_file(&path, &[&level]);
            }
        }
        let config = load_config(Some(&dir.path().join("level0.toml")));
        assert_eq!(config.log_level, "level0");
    }

    #[test]
    fn test_default_paths() {
        assert!(default_config_path().ends_with(".agentbus/config.toml"));
        assert!(agentbus_home().ends_with(".agentbus"));
    }
}
