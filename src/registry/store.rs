//! Mapping-file backed alias store
//!
//! One plain-text file per alias under the mapping directory; the file holds a
//! single connection string. Files are only removed by an explicit `remove`.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::alias::{DeviceAlias, PcmTarget};
use super::RegistryError;

/// Where the kernel lists sound cards
const ASOUND_ROOT: &str = "/proc/asound";

/// Alias → PCM target registry
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    mapping_dir: PathBuf,
    asound_root: PathBuf,
}

impl DeviceRegistry {
    pub fn new(mapping_dir: impl Into<PathBuf>) -> Self {
        Self {
            mapping_dir: mapping_dir.into(),
            asound_root: PathBuf::from(ASOUND_ROOT),
        }
    }

    /// Look up card ids under a different procfs root
    pub fn with_asound_root(mut self, asound_root: impl Into<PathBuf>) -> Self {
        self.asound_root = asound_root.into();
        self
    }

    pub fn mapping_dir(&self) -> &Path {
        &self.mapping_dir
    }

    fn mapping_path(&self, alias: &DeviceAlias) -> PathBuf {
        self.mapping_dir.join(alias.as_str())
    }

    /// Whether a mapping file exists for the alias
    pub fn contains(&self, alias: &DeviceAlias) -> bool {
        self.mapping_path(alias).is_file()
    }

    /// Read the raw connection string for an alias, trimmed of whitespace.
    ///
    /// Touches nothing but the mapping file.
    pub fn resolve_raw(&self, alias: &DeviceAlias) -> Result<String, RegistryError> {
        let path = self.mapping_path(alias);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let raw = content.trim();
                if raw.is_empty() {
                    return Err(RegistryError::Malformed {
                        input: String::new(),
                        reason: format!("mapping file {} is empty", path.display()),
                    });
                }
                if raw.lines().count() > 1 {
                    return Err(RegistryError::Malformed {
                        input: raw.to_string(),
                        reason: "mapping file must hold a single line".to_string(),
                    });
                }
                Ok(raw.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::UnknownAlias(alias.to_string()))
            }
            Err(e) => Err(RegistryError::Io(e)),
        }
    }

    /// Resolve an alias to exactly one concrete target
    ///
    /// Numeric card indexes are replaced by the card id so that every
    /// spelling of one physical device claims the same holder key.
    pub fn resolve(&self, alias: &DeviceAlias) -> Result<PcmTarget, RegistryError> {
        let raw = self.resolve_raw(alias)?;
        let target = raw.parse::<PcmTarget>()?.normalize_card(&self.asound_root);
        debug!("Resolved {} -> {}", alias, target);
        Ok(target)
    }

    /// Create or replace the mapping for an alias
    ///
    /// The file is written to a temporary name and renamed into place so a
    /// concurrently starting bridge never reads a half-written target.
    pub fn register(&self, alias: &DeviceAlias, target: &PcmTarget) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.mapping_dir)?;

        let path = self.mapping_path(alias);
        let tmp = self
            .mapping_dir
            .join(format!(".{}.tmp-{}", alias, std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp)?;
            writeln!(file, "{}", target)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(RegistryError::Io(e));
        }

        info!("Registered {} -> {}", alias, target);
        Ok(())
    }

    /// Explicitly delete a mapping. Returns whether one existed.
    pub fn remove(&self, alias: &DeviceAlias) -> Result<bool, RegistryError> {
        match std::fs::remove_file(self.mapping_path(alias)) {
            Ok(()) => {
                info!("Removed mapping for {}", alias);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RegistryError::Io(e)),
        }
    }

    /// List all registered aliases with their resolution result
    ///
    /// Stale or malformed mappings are reported, not dropped.
    pub fn list(&self) -> Result<Vec<(DeviceAlias, Result<PcmTarget, RegistryError>)>, RegistryError> {
        let entries = match std::fs::read_dir(&self.mapping_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::Io(e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let alias = match DeviceAlias::new(name.clone()) {
                Ok(a) => a,
                Err(_) => {
                    if !name.starts_with('.') {
                        warn!("Ignoring mapping file with invalid alias name: {}", name);
                    }
                    continue;
                }
            };
            let resolved = self.resolve(&alias);
            out.push((alias, resolved));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HwScheme;

    fn alias(name: &str) -> DeviceAlias {
        DeviceAlias::new(name).unwrap()
    }

    #[test]
    fn test_resolve_trims_trailing_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("BT_TEST"),
            "bluetooth:DEV=AA:BB:CC:DD:EE:FF,PROFILE=a2dp \n\n",
        )
        .unwrap();

        let registry = DeviceRegistry::new(dir.path());
        let raw = registry.resolve_raw(&alias("BT_TEST")).unwrap();
        assert_eq!(raw, "bluetooth:DEV=AA:BB:CC:DD:EE:FF,PROFILE=a2dp");

        let target = registry.resolve(&alias("BT_TEST")).unwrap();
        assert_eq!(target, raw.parse::<PcmTarget>().unwrap());
    }

    #[test]
    fn test_missing_mapping_is_unknown_alias() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path());
        assert!(matches!(
            registry.resolve(&alias("NOPE")),
            Err(RegistryError::UnknownAlias(_))
        ));
        assert!(!registry.contains(&alias("NOPE")));
    }

    #[test]
    fn test_empty_or_multiline_mapping_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("EMPTY"), "  \n").unwrap();
        std::fs::write(dir.path().join("TWO"), "hw:0,0\nhw:1,0\n").unwrap();

        let registry = DeviceRegistry::new(dir.path());
        assert!(matches!(
            registry.resolve(&alias("EMPTY")),
            Err(RegistryError::Malformed { .. })
        ));
        assert!(matches!(
            registry.resolve(&alias("TWO")),
            Err(RegistryError::Malformed { .. })
        ));
    }

    #[test]
    fn test_register_overwrites_and_remove_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            DeviceRegistry::new(dir.path().join("pcm")).with_asound_root(dir.path().join("asound"));
        let a = alias("DAC");

        registry.register(&a, &"hw:0,0".parse().unwrap()).unwrap();
        registry.register(&a, &"hw:1,0".parse().unwrap()).unwrap();
        assert_eq!(
            registry.resolve(&a).unwrap(),
            PcmTarget::Hardware {
                scheme: HwScheme::Hw,
                card: "1".into(),
                device: 0
            }
        );

        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);

        assert!(registry.remove(&a).unwrap());
        assert!(!registry.remove(&a).unwrap());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_keeps_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GOOD"), "hw:0,0").unwrap();
        std::fs::write(dir.path().join("BAD"), "garbage").unwrap();

        let registry = DeviceRegistry::new(dir.path());
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.as_str(), "BAD");
        assert!(listed[0].1.is_err());
        assert!(listed[1].1.is_ok());
    }

    #[test]
    fn test_index_and_id_spellings_share_a_device_key() {
        let dir = tempfile::tempdir().unwrap();
        let asound = dir.path().join("asound");
        std::fs::create_dir_all(asound.join("card1")).unwrap();
        std::fs::write(asound.join("card1").join("id"), "ICUSBAUDIO7D\n").unwrap();

        let pcm = dir.path().join("pcm");
        std::fs::create_dir_all(&pcm).unwrap();
        std::fs::write(pcm.join("BY_INDEX"), "hw:1,0").unwrap();
        std::fs::write(pcm.join("BY_ID"), "plughw:CARD=ICUSBAUDIO7D,DEV=0").unwrap();

        let registry = DeviceRegistry::new(&pcm).with_asound_root(&asound);
        let by_index = registry.resolve(&alias("BY_INDEX")).unwrap();
        let by_id = registry.resolve(&alias("BY_ID")).unwrap();
        assert_eq!(by_index.device_key(), by_id.device_key());
        assert_eq!(by_index.alsa_device(), "hw:CARD=ICUSBAUDIO7D,DEV=0");
        assert_eq!(by_id.alsa_device(), "plughw:CARD=ICUSBAUDIO7D,DEV=0");

        // The mapping file keeps what was written
        assert_eq!(registry.resolve_raw(&alias("BY_INDEX")).unwrap(), "hw:1,0");
    }
}
