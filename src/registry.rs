use std::path::{Path, PathBuf};

use crate::error::EphysError;

const URL_SCHEME: &str = "neurobank://";

/// Local lookup into the lab resource registry. The registry proper is an
/// external content-addressed service; the analysis tools only need to
/// resolve an identifier against a local archive, a directory of
/// per-resource subdirectories.
#[derive(Clone, Debug)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Registry root from the `--registry` flag, falling back to the
    /// `NBANK_REGISTRY` environment variable.
    pub fn from_flag_or_env(flag: Option<PathBuf>) -> Result<Self, EphysError> {
        match flag.or_else(|| std::env::var_os("NBANK_REGISTRY").map(PathBuf::from)) {
            Some(root) => Ok(Self::new(root)),
            None => Err(EphysError::NoRegistry),
        }
    }

    /// Resolve a resource id to its local directory, `None` when the
    /// resource is not deposited here.
    pub fn get(&self, id: &str) -> Option<PathBuf> {
        let path = self.root.join(id);
        path.is_dir().then_some(path)
    }

    /// Full URL form of a resource id, recorded in pprox documents so a
    /// reader can locate the source recording later.
    pub fn full_url(&self, id: &str) -> String {
        format!("{URL_SCHEME}{id}")
    }
}

/// Extract the resource id from a source URL (or pass a bare id through).
pub fn parse_resource_id(source: &str) -> &str {
    source
        .strip_prefix(URL_SCHEME)
        .unwrap_or(source)
        .rsplit('/')
        .next()
        .unwrap_or(source)
}

/// The short cell name is the first dash-separated field of the resource id.
pub fn short_name(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// Epoch recording files for a resource directory, sorted by name; epoch
/// indices are 1-based positions in this list.
pub fn epoch_files(dir: &Path) -> Result<Vec<PathBuf>, EphysError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let registry = Registry::new(PathBuf::from("/data/registry"));
        let url = registry.full_url("a1b2c3d4-20220101-1");
        assert_eq!(url, "neurobank://a1b2c3d4-20220101-1");
        assert_eq!(parse_resource_id(&url), "a1b2c3d4-20220101-1");
        assert_eq!(parse_resource_id("a1b2c3d4-20220101-1"), "a1b2c3d4-20220101-1");
    }

    #[test]
    fn short_names_drop_the_suffix() {
        assert_eq!(short_name("a1b2c3d4-20220101-1"), "a1b2c3d4");
        assert_eq!(short_name("plainname"), "plainname");
    }

    #[test]
    fn missing_root_is_an_error() {
        std::env::remove_var("NBANK_REGISTRY");
        assert!(matches!(
            Registry::from_flag_or_env(None),
            Err(EphysError::NoRegistry)
        ));
        let registry = Registry::from_flag_or_env(Some(PathBuf::from("/tmp"))).unwrap();
        assert_eq!(registry.full_url("x"), "neurobank://x");
    }
}
