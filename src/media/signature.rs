//! Strict JPEG header verification for untrusted frame buffers.
//!
//! Frames are handed to external encoder processes, so anything that does not
//! carry a genuine JPEG signature is rejected before a subprocess ever sees
//! it. Magic values from https://en.wikipedia.org/wiki/List_of_file_signatures

/// Check that `buffer` starts with a bare, JFIF, or Exif JPEG header.
pub fn verify_jpeg_header(buffer: &[u8]) -> bool {
    if buffer.len() < 12 {
        return false;
    }
    if buffer[0] != 0xFF || buffer[1] != 0xD8 || buffer[2] != 0xFF {
        return false;
    }
    match buffer[3] {
        // Bare SOI + SOI
        0xD8 => true,
        // APP0: must carry "JFIF\0" and version major 1
        0xE0 => &buffer[6..10] == b"JFIF" && buffer[10] == 0x00 && buffer[11] == 0x01,
        // APP1: must carry "Exif\0\0"
        0xE1 => &buffer[6..10] == b"Exif" && buffer[10] == 0x00 && buffer[11] == 0x00,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(header: &[u8]) -> Vec<u8> {
        let mut buf = header.to_vec();
        buf.resize(16, 0);
        buf
    }

    #[test]
    fn accepts_bare_header() {
        assert!(verify_jpeg_header(&padded(&[0xFF, 0xD8, 0xFF, 0xD8])));
    }

    #[test]
    fn accepts_jfif_header() {
        let buf = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
        ];
        assert!(verify_jpeg_header(&buf));
    }

    #[test]
    fn accepts_exif_header() {
        let buf = [
            0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x10, b'E', b'x', b'i', b'f', 0x00, 0x00,
        ];
        assert!(verify_jpeg_header(&buf));
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(!verify_jpeg_header(&[0xFF, 0xD8, 0xFF, 0xD8]));
        assert!(!verify_jpeg_header(&[]));
    }

    #[test]
    fn rejects_wrong_magic() {
        // PNG signature padded out
        assert!(!verify_jpeg_header(&padded(&[0x89, 0x50, 0x4E, 0x47])));
        // JPEG start but unknown fourth byte
        assert!(!verify_jpeg_header(&padded(&[0xFF, 0xD8, 0xFF, 0xDB])));
    }

    #[test]
    fn rejects_forged_app_markers() {
        let bad_jfif = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'X', 0x00, 0x01,
        ];
        assert!(!verify_jpeg_header(&bad_jfif));

        let bad_version = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x02,
        ];
        assert!(!verify_jpeg_header(&bad_version));

        let bad_exif = [
            0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x10, b'E', b'x', b'i', b'f', 0x00, 0x01,
        ];
        assert!(!verify_jpeg_header(&bad_exif));
    }
}
