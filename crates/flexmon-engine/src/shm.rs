use flexmon_common::types::MetricSample;
use glob_match::glob_match;
use std::fs;
use std::path::PathBuf;

/// Directory-backed shared-metric store.
///
/// Out-of-band producers drop one JSON file per `(quantity, asset)` pair;
/// the engine scans the directory at every tick so their samples join the
/// bus-delivered ones. The writer side exists for those producers and for
/// tests.
pub struct SharedMetricStore {
    dir: PathBuf,
}

impl SharedMetricStore {
    pub fn new(dir: impl Into<PathBuf>) -> SharedMetricStore {
        SharedMetricStore { dir: dir.into() }
    }

    fn path_for(&self, quantity: &str, asset: &str) -> PathBuf {
        self.dir.join(format!("{quantity}@{asset}.metric"))
    }

    /// Writes (or replaces) the sample's file.
    pub fn write(&self, sample: &MetricSample) -> std::io::Result<()> {
        let json = serde_json::to_vec(sample).map_err(std::io::Error::other)?;
        fs::write(self.path_for(&sample.quantity, &sample.asset), json)
    }

    /// Reads every stored sample whose asset and quantity match the glob
    /// patterns. Unreadable or unparsable files are logged and skipped.
    pub fn read_matching(&self, assets_pattern: &str, metrics_pattern: &str) -> Vec<MetricSample> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "Cannot scan metric store");
                return Vec::new();
            }
        };

        let mut samples = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_metric_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".metric"));
            if !is_metric_file {
                continue;
            }
            let sample: MetricSample = match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()))
            {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable metric file");
                    continue;
                }
            };
            if glob_match(assets_pattern, &sample.asset)
                && glob_match(metrics_pattern, &sample.quantity)
            {
                samples.push(sample);
            }
        }
        samples
    }
}
