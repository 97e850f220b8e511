use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::convert::ConvertOptions;

/// Persisted converter settings used by CLI workflows (`-config <file>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertSettings {
    pub output_root: Option<String>,
    pub fail_fast: bool,
    pub dry_run: bool,
    pub options: ConvertOptions,
}

/// Save converter settings to a JSON file.
pub fn save_settings(path: &Path, settings: &ConvertSettings) -> Result<()> {
    let content = serde_json::to_string_pretty(settings)
        .context("failed to serialize converter settings as JSON")?;
    fs::write(path, content)
        .with_context(|| format!("failed to save converter settings: {}", path.display()))?;
    Ok(())
}

/// Load converter settings from a JSON file. Missing keys keep their defaults.
pub fn load_settings(path: &Path) -> Result<ConvertSettings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to load converter settings: {}", path.display()))?;
    let settings: ConvertSettings =
        serde_json::from_str(&content).context("failed to parse converter settings JSON")?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::pmx::writer::TextEncoding;

    #[test]
    fn given_default_settings_when_serialize_then_json_contains_reorder_flag() {
        let settings = ConvertSettings::default();
        let json = serde_json::to_string(&settings).expect("serialize settings");
        assert!(json.contains("reorder_materials"));
    }

    #[test]
    fn given_partial_json_when_loading_then_missing_keys_use_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "fail_fast": true, "options": { "text_encoding": "Utf8" } }"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();

        assert!(settings.fail_fast);
        assert_eq!(settings.options.text_encoding, TextEncoding::Utf8);
        assert!(settings.options.reorder_materials);
        assert!(settings.options.apply_a_stance);
    }

    #[test]
    fn given_saved_settings_when_loading_then_values_survive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        let mut settings = ConvertSettings::default();
        settings.output_root = Some("out".to_string());
        settings.options.rename_morphs = false;

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).unwrap();

        assert_eq!(loaded.output_root.as_deref(), Some("out"));
        assert!(!loaded.options.rename_morphs);
    }
}
