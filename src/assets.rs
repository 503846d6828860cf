//! Static Error Responses. See spec §4.8.
//!
//! A fixed set of pre-loaded `image/gif` bytes served on bad-format,
//! too-large, and cannot-read outcomes. Loaded once at startup.

use std::path::Path;

/// A 1x1 transparent GIF, used as a fallback when the configured asset
/// directory doesn't carry real error images (e.g. a bare checkout).
const FALLBACK_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Debug, Clone)]
pub struct StaticAssets {
    pub toolarge: Vec<u8>,
    pub badformat: Vec<u8>,
    pub cannotread: Vec<u8>,
}

impl StaticAssets {
    pub fn load(asset_dir: &Path) -> Self {
        StaticAssets {
            toolarge: load_one(asset_dir, "toolarge.gif"),
            badformat: load_one(asset_dir, "badformat.gif"),
            cannotread: load_one(asset_dir, "cannotread.gif"),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&[u8]> {
        match name {
            "toolarge" => Some(&self.toolarge),
            "badformat" => Some(&self.badformat),
            "cannotread" => Some(&self.cannotread),
            _ => None,
        }
    }
}

fn load_one(asset_dir: &Path, file_name: &str) -> Vec<u8> {
    std::fs::read(asset_dir.join(file_name)).unwrap_or_else(|_| FALLBACK_GIF.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_asset_dir_falls_back() {
        let assets = StaticAssets::load(Path::new("/nonexistent/path/for/test"));
        assert_eq!(assets.toolarge, FALLBACK_GIF);
        assert_eq!(assets.badformat, FALLBACK_GIF);
        assert_eq!(assets.cannotread, FALLBACK_GIF);
    }

    #[test]
    fn reads_real_files_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toolarge.gif"), b"REAL-BYTES").unwrap();
        let assets = StaticAssets::load(dir.path());
        assert_eq!(assets.toolarge, b"REAL-BYTES");
        assert_eq!(assets.badformat, FALLBACK_GIF);
    }

    #[test]
    fn by_name_looks_up_correct_asset() {
        let assets = StaticAssets::load(Path::new("/nonexistent"));
        assert!(assets.by_name("toolarge").is_some());
        assert!(assets.by_name("nope").is_none());
    }
}
