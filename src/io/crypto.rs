use crate::error::Result;
use sha2::{Digest, Sha256};
use std::{fs::File, io::Read, path::Path};

/// Hex SHA-256 of a file, read in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(path: &Path, expected_hex: &str) -> Result<bool> {
    let got = sha256_file(path)?;
    Ok(got.eq_ignore_ascii_case(expected_hex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"stem bytes").unwrap();
        let on_disk = sha256_file(f.path()).unwrap();
        assert_eq!(on_disk, digest(b"stem bytes"));
        assert!(verify_sha256(f.path(), &on_disk.to_uppercase()).unwrap());
    }

    #[test]
    fn empty_payload_digest() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
