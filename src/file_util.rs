//! Digest and gzip helpers / 摘要与gzip压缩工具
//!
//! Digests are SHA-256 encoded as standard base64, matching the
//! `sfc-digest` metadata stored with every staged object.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};

const DIGEST_BLOCK_SIZE: usize = 64 * 1024;

/// Hash everything readable from `src` / 流式计算SHA-256
fn digest_reader<R: Read>(src: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BLOCK_SIZE];
    let mut size = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((BASE64.encode(hasher.finalize()), size))
}

/// Get SHA-256 digest (base64) and size of a file / 获取文件的摘要和大小
pub fn digest_and_size_for_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)
        .map_err(|e| anyhow!("Failed to open {} for digest: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    Ok(digest_reader(&mut reader)?)
}

/// Get SHA-256 digest (base64) and size of a stream / 获取流的摘要和大小
///
/// Hashes from the current position to the end, then seeks back so the
/// caller can read the same bytes again.
pub fn digest_and_size_for_stream<R: Read + Seek>(src: &mut R) -> Result<(String, u64)> {
    let start = src.stream_position()?;
    let result = digest_reader(src)?;
    src.seek(SeekFrom::Start(start))?;
    Ok(result)
}

/// Digest of an in-memory buffer / 内存数据的摘要
pub fn digest_and_size_for_bytes(data: &Bytes) -> Result<(String, u64)> {
    digest_and_size_for_stream(&mut Cursor::new(data.as_ref()))
}

/// A gzip encoder whose header carries neither mtime nor file name,
/// so identical input always produces identical output.
fn gzip_encoder<W: Write>(out: W) -> flate2::write::GzEncoder<W> {
    GzBuilder::new()
        .mtime(0)
        .write(out, Compression::default())
}

/// Compress a file into `tmp_dir` with gzip / 使用gzip压缩文件到临时目录
///
/// Returns the path of the compressed file and its size.
pub fn compress_file_with_gzip(src: &Path, tmp_dir: &Path) -> Result<(PathBuf, u64)> {
    let base = src.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("Invalid source file name: {}", src.display()))?;
    let dst = tmp_dir.join(format!("{}.gz", base));

    tracing::debug!("Compressing {} -> {}", src.display(), dst.display());

    let mut reader = BufReader::new(
        File::open(src).map_err(|e| anyhow!("Failed to open {}: {}", src.display(), e))?,
    );
    let writer = BufWriter::new(
        File::create(&dst).map_err(|e| anyhow!("Failed to create {}: {}", dst.display(), e))?,
    );
    let mut encoder = gzip_encoder(writer);
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    drop(writer);

    let size = std::fs::metadata(&dst)?.len();
    Ok((dst, size))
}

/// Compress an in-memory stream with gzip / 压缩内存数据
pub fn compress_stream_with_gzip<R: Read>(src: &mut R) -> Result<Bytes> {
    let mut encoder = gzip_encoder(Vec::new());
    io::copy(src, &mut encoder)?;
    Ok(Bytes::from(encoder.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_digest_known_value() {
        // sha256("") in base64
        let (digest, size) = digest_and_size_for_bytes(&Bytes::new()).unwrap();
        assert_eq!(digest, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
        assert_eq!(size, 0);
    }

    #[test]
    fn test_stream_digest_restores_position() {
        let mut cursor = Cursor::new(b"header,row1,row2".to_vec());
        cursor.seek(SeekFrom::Start(7)).unwrap();
        let (digest, size) = digest_and_size_for_stream(&mut cursor).unwrap();
        assert_eq!(size, 9);
        assert_eq!(cursor.position(), 7);

        let (again, _) = digest_and_size_for_stream(&mut cursor).unwrap();
        assert_eq!(digest, again);
    }

    #[test]
    fn test_file_and_stream_digest_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let content = b"1,2,3\n4,5,6\n".repeat(10_000);
        std::fs::write(&path, &content).unwrap();

        let from_file = digest_and_size_for_file(&path).unwrap();
        let from_bytes = digest_and_size_for_bytes(&Bytes::from(content.clone())).unwrap();
        assert_eq!(from_file, from_bytes);
        assert_eq!(from_file.1, content.len() as u64);
    }

    #[test]
    fn test_gzip_round_trip_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.csv");
        let content = b"id,name\n1,alpha\n2,beta\n".repeat(5_000);
        std::fs::write(&src, &content).unwrap();

        let out1 = tempfile::tempdir().unwrap();
        let out2 = tempfile::tempdir().unwrap();
        let (gz1, size1) = compress_file_with_gzip(&src, out1.path()).unwrap();
        // Touch the source so its mtime differs between runs
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&src, &content).unwrap();
        let (gz2, size2) = compress_file_with_gzip(&src, out2.path()).unwrap();

        assert_eq!(gz1.file_name().unwrap(), "data.csv.gz");
        assert_eq!(size1, size2);
        let bytes1 = std::fs::read(&gz1).unwrap();
        let bytes2 = std::fs::read(&gz2).unwrap();
        assert_eq!(bytes1, bytes2);
        assert_eq!(digest_and_size_for_file(&gz1).unwrap(), digest_and_size_for_file(&gz2).unwrap());
        assert_eq!(gunzip(&bytes1), content);
    }

    #[test]
    fn test_gzip_header_normalized() {
        let gz = compress_stream_with_gzip(&mut Cursor::new(b"abc".to_vec())).unwrap();
        assert_eq!(&gz[..2], &[0x1f, 0x8b]);
        // FLG has no FNAME bit and MTIME is zero
        assert_eq!(gz[3] & 0x08, 0);
        assert_eq!(&gz[4..8], &[0, 0, 0, 0]);
        assert_eq!(gunzip(&gz), b"abc");
    }
}
