// Licensed under the Apache-2.0 license

use ota_config::{IMAGE_CHECKSUM_FIELD_LEN, IMAGE_CHECKSUM_FIELD_OFFSET, IMAGE_MAGIC, KIB, MIB};

/// Write/read chunk size for an image of `file_size` bytes. Large images use
/// 8 KiB chunks, or 4 KiB when the target is an OTA slot.
pub fn calculate_chunk_size(file_size: u64, ota_target: bool) -> usize {
    let chunk = if file_size <= 64 * KIB as u64 {
        KIB
    } else if file_size <= 256 * KIB as u64 {
        2 * KIB
    } else if file_size <= MIB as u64 {
        4 * KIB
    } else if ota_target {
        4 * KIB
    } else {
        8 * KIB
    };
    chunk as usize
}

/// Zeroes the header checksum field of a truncated image so that the boot
/// loader does not reject it for a hash it can no longer match. Returns
/// whether the chunk started with the image magic and was patched.
pub fn patch_truncated_header(first_chunk: &mut [u8]) -> bool {
    let end = IMAGE_CHECKSUM_FIELD_OFFSET + IMAGE_CHECKSUM_FIELD_LEN;
    if first_chunk.first() != Some(&IMAGE_MAGIC) || first_chunk.len() < end {
        return false;
    }
    first_chunk[IMAGE_CHECKSUM_FIELD_OFFSET..end].fill(0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_policy() {
        assert_eq!(calculate_chunk_size(0, false), 1024);
        assert_eq!(calculate_chunk_size(64 * 1024, false), 1024);
        assert_eq!(calculate_chunk_size(64 * 1024 + 1, false), 2048);
        assert_eq!(calculate_chunk_size(256 * 1024, true), 2048);
        assert_eq!(calculate_chunk_size(1024 * 1024, false), 4096);
        assert_eq!(calculate_chunk_size(1024 * 1024 + 1, false), 8192);
        assert_eq!(calculate_chunk_size(1024 * 1024 + 1, true), 4096);
    }

    #[test]
    fn test_patch_truncated_header() {
        let mut image = [0xAAu8; 32];
        image[0] = IMAGE_MAGIC;
        assert!(patch_truncated_header(&mut image));
        assert_eq!(image[23], 0);
        assert_eq!(image[22], 0xAA);
        assert_eq!(image[24], 0xAA);

        let mut other = [0xAAu8; 32];
        assert!(!patch_truncated_header(&mut other));
        assert_eq!(other[23], 0xAA);

        let mut short = [IMAGE_MAGIC, 1, 2];
        assert!(!patch_truncated_header(&mut short));
    }
}
