use std::path::Path;

use serde::{Deserialize, Serialize};

/// One extracted palette in final output order.
///
/// `position` is the image's index in the merged URL list (or 0 for an
/// upload), `source` the wire name of the service that supplied it (or
/// `"upload"`), and `colors` the `#rrggbb` strings in centroid order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaletteRecord {
    pub position: usize,
    pub source: String,
    pub url: Option<String>,
    pub colors: Vec<String>,
}

/// Machine-readable run result, written as `palettes.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub prompt: String,
    pub palettes: Vec<PaletteRecord>,
}

pub fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{write_report, PaletteRecord, RunReport};

    #[test]
    fn write_report_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("palettes.json");

        let report = RunReport {
            run_id: "run-9".to_string(),
            prompt: "sunset".to_string(),
            palettes: vec![
                PaletteRecord {
                    position: 0,
                    source: "unsplash".to_string(),
                    url: Some("https://images.example/a.jpg".to_string()),
                    colors: vec!["#ff0000".to_string(), "#00ff00".to_string()],
                },
                PaletteRecord {
                    position: 1,
                    source: "upload".to_string(),
                    url: None,
                    colors: vec!["#0000ff".to_string()],
                },
            ],
        };
        write_report(&path, &report)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed["run_id"], json!("run-9"));
        assert_eq!(parsed["palettes"][0]["position"], json!(0));
        assert_eq!(parsed["palettes"][0]["colors"][0], json!("#ff0000"));
        assert_eq!(parsed["palettes"][1]["url"], Value::Null);

        let back: RunReport = serde_json::from_value(parsed)?;
        assert_eq!(back, report);
        Ok(())
    }
}
