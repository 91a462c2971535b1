//! Tarball extraction: gzip, bzip2, xz, zstd, or uncompressed.
//!
//! The source is classified as a tarball by its suffix; the compression
//! layer is then picked from the stream's magic bytes, so a mislabelled
//! `.tar.gz` that is really xz still extracts.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::ImportError;

#[derive(Debug, PartialEq)]
enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

fn detect_compression(path: &Path) -> Result<Compression> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 6];
    let n = file
        .read(&mut magic)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(detect_compression_magic(&magic[..n]))
}

fn detect_compression_magic(magic: &[u8]) -> Compression {
    if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(b"BZh") {
        Compression::Bzip2
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Xz
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn get_decoder(file: File, compression: &Compression) -> Result<Box<dyn Read>> {
    match compression {
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(file))),
        Compression::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(file))),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(file))),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .context("failed to create zstd decoder")?;
            Ok(Box::new(decoder))
        }
        Compression::None => Ok(Box::new(file)),
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(crate::is_privileged());
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);
    for entry in archive.entries().context("failed to read tar entries")? {
        let mut entry = entry.context("failed to read tar entry")?;
        entry.unpack_in(dest).with_context(|| {
            format!(
                "failed to unpack {}",
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            )
        })?;
    }
    Ok(())
}

/// Extract `tarball` into the existing directory `dest`.
pub fn extract(tarball: &Path, dest: &Path) -> Result<()> {
    let compression = detect_compression(tarball)?;
    log::info!(
        "extracting {} ({:?}) -> {}",
        tarball.display(),
        compression,
        dest.display()
    );

    let file =
        File::open(tarball).with_context(|| format!("failed to open {}", tarball.display()))?;
    unpack_tar(get_decoder(file, &compression)?, dest).map_err(|e| ImportError::ExtractFailed {
        archive: tarball.to_path_buf(),
        reason: format!("{e:#}"),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    struct TempDir {
        dir: PathBuf,
    }

    impl TempDir {
        fn new(suffix: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "stratum-import-test-tarball-{}-{:?}-{suffix}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(dir.join("src")).unwrap();
            fs::create_dir_all(dir.join("out")).unwrap();
            Self { dir }
        }

        fn src(&self) -> PathBuf {
            self.dir.join("src")
        }

        fn out(&self) -> PathBuf {
            self.dir.join("out")
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn populate(src: &Path) {
        fs::write(src.join("hello.txt"), "hello world\n").unwrap();
        fs::create_dir(src.join("etc")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=alpine\n").unwrap();
    }

    fn assert_populated(out: &Path) {
        assert_eq!(
            fs::read_to_string(out.join("hello.txt")).unwrap(),
            "hello world\n"
        );
        assert_eq!(
            fs::read_to_string(out.join("etc/os-release")).unwrap(),
            "ID=alpine\n"
        );
    }

    #[test]
    fn test_detect_compression_magic() {
        assert_eq!(detect_compression_magic(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(detect_compression_magic(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(
            detect_compression_magic(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            Compression::Xz
        );
        assert_eq!(
            detect_compression_magic(&[0x28, 0xb5, 0x2f, 0xfd]),
            Compression::Zstd
        );
        assert_eq!(detect_compression_magic(b"ustar"), Compression::None);
        assert_eq!(detect_compression_magic(&[]), Compression::None);
    }

    #[test]
    fn test_extract_gzip() {
        let tmp = TempDir::new("gz");
        populate(&tmp.src());

        let tarball = tmp.dir.join("rootfs.tar.gz");
        let file = File::create(&tarball).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", tmp.src()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        extract(&tarball, &tmp.out()).unwrap();
        assert_populated(&tmp.out());
    }

    #[test]
    fn test_extract_zstd() {
        let tmp = TempDir::new("zst");
        populate(&tmp.src());

        let tarball = tmp.dir.join("rootfs.tar.zst");
        let file = File::create(&tarball).unwrap();
        let encoder = zstd::stream::write::Encoder::new(file, 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", tmp.src()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        extract(&tarball, &tmp.out()).unwrap();
        assert_populated(&tmp.out());
    }

    #[test]
    fn test_extract_uncompressed() {
        let tmp = TempDir::new("plain");
        populate(&tmp.src());

        let tarball = tmp.dir.join("rootfs.tar");
        let mut builder = tar::Builder::new(File::create(&tarball).unwrap());
        builder.append_dir_all(".", tmp.src()).unwrap();
        builder.finish().unwrap();

        extract(&tarball, &tmp.out()).unwrap();
        assert_populated(&tmp.out());
    }

    #[test]
    fn test_extract_corrupt_is_extract_failed() {
        let tmp = TempDir::new("corrupt");
        let tarball = tmp.dir.join("broken.tar");
        // Not a valid ustar header: the checksum cannot match.
        fs::write(&tarball, vec![b'A'; 1024]).unwrap();

        let err = extract(&tarball, &tmp.out()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::ExtractFailed { .. })
        ));
    }
}
