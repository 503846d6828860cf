//! Magic-byte content sniffing. See spec §4.5.
//!
//! Purely magic-byte based, on the first up-to-1024 bytes. The upstream
//! Content-Type header is never consulted; this is the sole authority for
//! the stored Content-Type.

pub const SNIFF_WINDOW: usize = 1024;

pub fn sniff(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0x47, 0x49, 0x46, 0x38]) {
        return Some("image/gif");
    }
    if bytes.starts_with(&[0x42, 0x4D]) {
        return Some("image/bmp");
    }
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return Some("image/jpeg");
    }
    // Legacy/BOM variant: PNG signature shifted one byte in.
    if bytes.len() >= 4 && &bytes[1..4] == b"PNG" {
        return Some("image/png");
    }
    None
}
