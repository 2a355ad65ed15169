//! Reads a [`shk::RawManifest`] off disk.
//!
//! The ninja-grammar lexer that would normally produce this type from a
//! `build.ninja` file is out of scope; this loader stands in for it by
//! reading the manifest as JSON, matching the shape `RawManifest` already
//! derives `Serialize`/`Deserialize` for.

use anyhow::{Context, Result};
use camino::Utf8Path;
use shk::RawManifest;

pub fn load(path: &Utf8Path) -> Result<RawManifest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest `{path}`"))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse manifest `{path}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_minimal_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"steps": [{{"command": "touch out", "outputs": ["out"]}}], "defaults": [], "pools": [], "build_dir": null}}"#
        )
        .unwrap();
        let path = Utf8Path::from_path(file.path()).unwrap();
        let manifest = load(path).unwrap();
        assert_eq!(manifest.steps.len(), 1);
        assert_eq!(manifest.steps[0].outputs, vec!["out".to_string()]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = Utf8Path::new("/nonexistent/shk-manifest-loader-test/build.ninja");
        assert!(load(path).is_err());
    }
}
