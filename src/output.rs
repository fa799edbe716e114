use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::matcher::VersionResult;

/// Writes one application's detection report in the §6 per-application
/// output format: repeating `lib:`/`similarity:` triplets, sorted by
/// package name, terminated by a `time:` line.
pub(crate) fn write_application_output(
    output_path: &Path,
    results: &BTreeMap<String, VersionResult>,
    duration: Duration,
) -> Result<()> {
    let mut file = File::create(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    for result in results.values() {
        writeln!(file, "lib: {}", format_package_label(&result.filenames))?;
        writeln!(file, "similarity: {}", result.ratio)?;
        writeln!(file)?;
    }
    writeln!(file, "time: {:.3}s", duration.as_secs_f64())?;
    Ok(())
}

/// Joins tied version filenames into the `X_v1 and X_v2` label (§4.3.4),
/// stripping each filename's extension.
pub(crate) fn format_package_label(filenames: &[String]) -> String {
    filenames
        .iter()
        .map(|filename| strip_extension(filename))
        .collect::<Vec<_>>()
        .join(" and ")
}

fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) => &filename[..idx],
        None => filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_version_label_strips_extension() {
        assert_eq!(format_package_label(&["X_v1.txt".to_string()]), "X_v1");
    }

    #[test]
    fn tied_versions_are_joined() {
        let labels = vec!["X_v1.txt".to_string(), "X_v2.txt".to_string()];
        assert_eq!(format_package_label(&labels), "X_v1 and X_v2");
    }

    #[test]
    fn writes_triplets_and_trailing_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        let mut results = BTreeMap::new();
        results.insert(
            "com.example".to_string(),
            VersionResult {
                filenames: vec!["X_v1.txt".to_string()],
                ratio: 1.0,
            },
        );
        write_application_output(&path, &results, Duration::from_secs(2)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("lib: X_v1\nsimilarity: 1\n\n"));
        assert!(content.trim_end().ends_with("time: 2.000s"));
    }
}
