//! Envelope encryption / 信封加密
//!
//! Each file gets a random content key and IV. Content is encrypted with
//! AES-CBC (PKCS5 padding) under the content key; the content key itself is
//! wrapped with the query stage master key under AES-ECB. The wrapped key,
//! IV and material descriptor travel with the object as metadata.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes::cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

const BLOCK_SIZE: usize = 16;
const CHUNK_SIZE: usize = BLOCK_SIZE * 4 * 1024;

/// Master key material handed out per query / 每次查询下发的主密钥材料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMaterial {
    /// Base64 encoded master key / base64编码的主密钥
    #[serde(rename = "queryStageMasterKey")]
    pub query_stage_master_key: String,
    #[serde(rename = "queryId")]
    pub query_id: String,
    #[serde(rename = "smkId")]
    pub smk_id: i64,
}

/// Metadata stored with an encrypted object / 与加密对象一起保存的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    /// Wrapped content key, base64 / 包装后的内容密钥
    pub key: String,
    /// Content IV, base64
    pub iv: String,
    /// Material descriptor JSON
    pub matdesc: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MaterialDescriptor {
    #[serde(rename = "smkId")]
    smk_id: String,
    #[serde(rename = "queryId")]
    query_id: String,
    #[serde(rename = "keySize")]
    key_size: String,
}

impl EncryptionMaterial {
    fn decoded_master_key(&self) -> Result<Vec<u8>> {
        let key = BASE64.decode(self.query_stage_master_key.trim())
            .map_err(|e| anyhow!("Invalid master key encoding: {}", e))?;
        match key.len() {
            16 | 24 | 32 => Ok(key),
            n => Err(anyhow!("Unsupported master key length: {} bytes", n)),
        }
    }

    fn material_descriptor(&self, key_len: usize) -> Result<String> {
        let desc = MaterialDescriptor {
            smk_id: self.smk_id.to_string(),
            query_id: self.query_id.clone(),
            key_size: (key_len * 8).to_string(),
        };
        Ok(serde_json::to_string(&desc)?)
    }
}

fn pkcs5_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

fn pkcs5_unpad(data: &[u8]) -> Result<&[u8]> {
    let pad = *data.last().ok_or_else(|| anyhow!("Empty padded data"))? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        bail!("Invalid padding length: {}", pad);
    }
    if data[data.len() - pad..].iter().any(|&b| b as usize != pad) {
        bail!("Invalid padding bytes");
    }
    Ok(&data[..data.len() - pad])
}

/// Fill `buf` as far as the reader allows / 尽量读满缓冲区
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = src.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

fn ecb_encrypt<C: BlockEncrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher = C::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn ecb_decrypt<C: BlockDecrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher = C::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Wrap the content key with the master key (AES-ECB) / 用主密钥包装内容密钥
fn wrap_key(master_key: &[u8], file_key: &[u8]) -> Result<Vec<u8>> {
    let mut data = pkcs5_pad(file_key);
    match master_key.len() {
        16 => ecb_encrypt::<Aes128>(master_key, &mut data)?,
        24 => ecb_encrypt::<Aes192>(master_key, &mut data)?,
        32 => ecb_encrypt::<Aes256>(master_key, &mut data)?,
        n => bail!("Unsupported master key length: {} bytes", n),
    }
    Ok(data)
}

fn unwrap_key(master_key: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.is_empty() || wrapped.len() % BLOCK_SIZE != 0 {
        bail!("Wrapped key has invalid length: {}", wrapped.len());
    }
    let mut data = wrapped.to_vec();
    match master_key.len() {
        16 => ecb_decrypt::<Aes128>(master_key, &mut data)?,
        24 => ecb_decrypt::<Aes192>(master_key, &mut data)?,
        32 => ecb_decrypt::<Aes256>(master_key, &mut data)?,
        n => bail!("Unsupported master key length: {} bytes", n),
    }
    Ok(pkcs5_unpad(&data)?.to_vec())
}

fn cbc_encrypt<C, R, W>(key: &[u8], iv: &[u8], src: &mut R, out: &mut W) -> Result<()>
where
    C: BlockEncryptMut + KeyIvInit,
    R: Read,
    W: Write,
{
    let mut cipher = C::new_from_slices(key, iv).map_err(|e| anyhow!("Invalid key or IV: {}", e))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(src, &mut buf)?;
        if n < CHUNK_SIZE {
            // Final chunk: always padded, a full block when already aligned
            let padded = (n / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let pad = (padded - n) as u8;
            buf[n..padded].fill(pad);
            for block in buf[..padded].chunks_exact_mut(BLOCK_SIZE) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            out.write_all(&buf[..padded])?;
            break;
        }
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.write_all(&buf)?;
    }
    out.flush()?;
    Ok(())
}

fn cbc_decrypt<C, R, W>(key: &[u8], iv: &[u8], src: &mut R, out: &mut W) -> Result<()>
where
    C: BlockDecryptMut + KeyIvInit,
    R: Read,
    W: Write,
{
    let mut cipher = C::new_from_slices(key, iv).map_err(|e| anyhow!("Invalid key or IV: {}", e))?;
    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut n = read_full(src, &mut current)?;
    if n == 0 {
        bail!("Encrypted data is empty");
    }
    loop {
        if n % BLOCK_SIZE != 0 {
            bail!("Encrypted data is not a multiple of the block size");
        }
        // Look ahead so the last chunk can be unpadded
        let m = if n == CHUNK_SIZE { read_full(src, &mut next)? } else { 0 };
        for block in current[..n].chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        if m == 0 {
            out.write_all(pkcs5_unpad(&current[..n])?)?;
            break;
        }
        out.write_all(&current[..n])?;
        std::mem::swap(&mut current, &mut next);
        n = m;
    }
    out.flush()?;
    Ok(())
}

/// Encrypt a stream, writing ciphertext to `out` / 加密数据流
pub fn encrypt_stream<R: Read, W: Write>(
    material: &EncryptionMaterial,
    src: &mut R,
    out: &mut W,
) -> Result<EncryptionMetadata> {
    let master_key = material.decoded_master_key()?;
    let key_len = master_key.len();

    let mut rng = rand::thread_rng();
    let mut file_key = vec![0u8; key_len];
    rng.fill_bytes(&mut file_key);
    let mut iv = [0u8; BLOCK_SIZE];
    rng.fill_bytes(&mut iv);

    match key_len {
        16 => cbc_encrypt::<cbc::Encryptor<Aes128>, _, _>(&file_key, &iv, src, out)?,
        24 => cbc_encrypt::<cbc::Encryptor<Aes192>, _, _>(&file_key, &iv, src, out)?,
        _ => cbc_encrypt::<cbc::Encryptor<Aes256>, _, _>(&file_key, &iv, src, out)?,
    }

    let wrapped = wrap_key(&master_key, &file_key)?;
    Ok(EncryptionMetadata {
        key: BASE64.encode(wrapped),
        iv: BASE64.encode(iv),
        matdesc: material.material_descriptor(key_len)?,
    })
}

/// Decrypt a stream produced by [`encrypt_stream`] / 解密数据流
pub fn decrypt_stream<R: Read, W: Write>(
    metadata: &EncryptionMetadata,
    material: &EncryptionMaterial,
    src: &mut R,
    out: &mut W,
) -> Result<()> {
    let master_key = material.decoded_master_key()?;
    let wrapped = BASE64.decode(&metadata.key)
        .map_err(|e| anyhow!("Invalid wrapped key encoding: {}", e))?;
    let iv = BASE64.decode(&metadata.iv)
        .map_err(|e| anyhow!("Invalid IV encoding: {}", e))?;
    let file_key = unwrap_key(&master_key, &wrapped)?;

    match file_key.len() {
        16 => cbc_decrypt::<cbc::Decryptor<Aes128>, _, _>(&file_key, &iv, src, out),
        24 => cbc_decrypt::<cbc::Decryptor<Aes192>, _, _>(&file_key, &iv, src, out),
        32 => cbc_decrypt::<cbc::Decryptor<Aes256>, _, _>(&file_key, &iv, src, out),
        n => Err(anyhow!("Unwrapped content key has invalid length: {}", n)),
    }
}

/// Encrypt a file into `tmp_dir` / 加密文件到临时目录
///
/// Returns the metadata and the path of the encrypted copy.
pub fn encrypt_file(
    material: &EncryptionMaterial,
    src: &Path,
    tmp_dir: &Path,
) -> Result<(EncryptionMetadata, PathBuf)> {
    let base = src.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("Invalid source file name: {}", src.display()))?;
    let dst = tmp_dir.join(format!("{}.enc", base));

    tracing::debug!("Encrypting {} -> {}", src.display(), dst.display());

    let mut reader = BufReader::new(
        File::open(src).map_err(|e| anyhow!("Failed to open {}: {}", src.display(), e))?,
    );
    let mut writer = BufWriter::new(
        File::create(&dst).map_err(|e| anyhow!("Failed to create {}: {}", dst.display(), e))?,
    );
    let metadata = encrypt_stream(material, &mut reader, &mut writer)?;
    Ok((metadata, dst))
}

/// Decrypt a file into a temp file inside `dst_dir` / 解密文件到目标目录下的临时文件
///
/// The caller persists the returned file to its final name, which is an
/// atomic rename on the same filesystem.
pub fn decrypt_file(
    metadata: &EncryptionMetadata,
    material: &EncryptionMaterial,
    src: &Path,
    dst_dir: &Path,
) -> Result<NamedTempFile> {
    tracing::debug!("Decrypting {}", src.display());

    let mut reader = BufReader::new(
        File::open(src).map_err(|e| anyhow!("Failed to open {}: {}", src.display(), e))?,
    );
    let tmp = NamedTempFile::new_in(dst_dir)
        .map_err(|e| anyhow!("Failed to create temp file in {}: {}", dst_dir.display(), e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        decrypt_stream(metadata, material, &mut reader, &mut writer)?;
    }
    Ok(tmp)
}

/// `encryptiondata` metadata document used by Azure and GCS / 加密元数据文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionData {
    pub encryption_mode: String,
    pub wrapped_content_key: WrappedContentKey,
    pub encryption_agent: EncryptionAgent,
    #[serde(rename = "ContentEncryptionIV")]
    pub content_encryption_iv: String,
    pub key_wrapping_metadata: KeyWrappingMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedContentKey {
    pub key_id: String,
    pub encrypted_key: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAgent {
    pub protocol: String,
    pub encryption_algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyWrappingMetadata {
    pub encryption_library: String,
}

impl EncryptionData {
    /// Describe `metadata`; `agent_algorithm` differs per cloud
    pub fn new(metadata: &EncryptionMetadata, agent_algorithm: &str) -> Self {
        Self {
            encryption_mode: "FullBlob".to_string(),
            wrapped_content_key: WrappedContentKey {
                key_id: "symmKey1".to_string(),
                encrypted_key: metadata.key.clone(),
                algorithm: "AES_CBC_256".to_string(),
            },
            encryption_agent: EncryptionAgent {
                protocol: "1.0".to_string(),
                encryption_algorithm: agent_algorithm.to_string(),
            },
            content_encryption_iv: metadata.iv.clone(),
            key_wrapping_metadata: KeyWrappingMetadata {
                encryption_library: "Java 5.3.0".to_string(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild metadata from the header value and the separate matdesc header
    pub fn parse_metadata(json: &str, matdesc: Option<&str>) -> Result<EncryptionMetadata> {
        let data: EncryptionData = serde_json::from_str(json)
            .map_err(|e| anyhow!("Invalid encryption data: {}", e))?;
        Ok(EncryptionMetadata {
            key: data.wrapped_content_key.encrypted_key,
            iv: data.content_encryption_iv,
            matdesc: matdesc.unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn material(key_len: usize) -> EncryptionMaterial {
        let key: Vec<u8> = (0..key_len as u8).collect();
        EncryptionMaterial {
            query_stage_master_key: BASE64.encode(key),
            query_id: "01a2b3c4-0000-1111".to_string(),
            smk_id: 42,
        }
    }

    fn round_trip(material: &EncryptionMaterial, plain: &[u8]) -> (EncryptionMetadata, Vec<u8>, Vec<u8>) {
        let mut cipher = Vec::new();
        let metadata = encrypt_stream(material, &mut Cursor::new(plain), &mut cipher).unwrap();
        let mut decrypted = Vec::new();
        decrypt_stream(&metadata, material, &mut Cursor::new(&cipher), &mut decrypted).unwrap();
        (metadata, cipher, decrypted)
    }

    #[test]
    fn test_stream_round_trip_all_key_sizes() {
        let plain = b"col1,col2\nvalue,other\n".repeat(4_000);
        for key_len in [16, 24, 32] {
            let m = material(key_len);
            let (_, cipher, decrypted) = round_trip(&m, &plain);
            assert_eq!(decrypted, plain);
            assert_eq!(cipher.len(), (plain.len() / 16 + 1) * 16);
        }
    }

    #[test]
    fn test_round_trip_edge_sizes() {
        let m = material(32);
        for size in [0usize, 1, 15, 16, 17, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, CHUNK_SIZE * 2] {
            let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let (_, cipher, decrypted) = round_trip(&m, &plain);
            assert_eq!(decrypted, plain, "size {}", size);
            assert_eq!(cipher.len() % 16, 0);
            assert!(cipher.len() > plain.len());
        }
    }

    #[test]
    fn test_metadata_shape() {
        let m = material(16);
        let (metadata, _, _) = round_trip(&m, b"abc");
        // 16 byte content key plus a full padding block
        assert_eq!(BASE64.decode(&metadata.key).unwrap().len(), 32);
        assert_eq!(BASE64.decode(&metadata.iv).unwrap().len(), 16);
        let desc: serde_json::Value = serde_json::from_str(&metadata.matdesc).unwrap();
        assert_eq!(desc["smkId"], "42");
        assert_eq!(desc["queryId"], "01a2b3c4-0000-1111");
        assert_eq!(desc["keySize"], "128");
    }

    #[test]
    fn test_random_key_and_iv_per_call() {
        let m = material(32);
        let (a, cipher_a, _) = round_trip(&m, b"same content");
        let (b, cipher_b, _) = round_trip(&m, b"same content");
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.key, b.key);
        assert_ne!(cipher_a, cipher_b);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let m = material(32);
        let mut cipher = Vec::new();
        let metadata = encrypt_stream(&m, &mut Cursor::new(b"secret".to_vec()), &mut cipher).unwrap();

        let mut other = material(32);
        other.query_stage_master_key = BASE64.encode([7u8; 32]);
        let mut out = Vec::new();
        let result = decrypt_stream(&metadata, &other, &mut Cursor::new(&cipher), &mut out);
        // A wrong key almost never yields valid padding on both layers
        assert!(result.is_err() || out != b"secret");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.csv");
        let plain = b"a,b,c\n".repeat(50_000);
        std::fs::write(&src, &plain).unwrap();

        let m = material(32);
        let (metadata, encrypted) = encrypt_file(&m, &src, dir.path()).unwrap();
        assert_ne!(std::fs::read(&encrypted).unwrap(), plain);

        let out_dir = tempfile::tempdir().unwrap();
        let decrypted = decrypt_file(&metadata, &m, &encrypted, out_dir.path()).unwrap();
        let final_path = out_dir.path().join("data.csv");
        decrypted.persist(&final_path).unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), plain);
    }

    #[test]
    fn test_invalid_master_key_length() {
        let m = EncryptionMaterial {
            query_stage_master_key: BASE64.encode([1u8; 10]),
            query_id: "q".into(),
            smk_id: 1,
        };
        let mut out = Vec::new();
        assert!(encrypt_stream(&m, &mut Cursor::new(b"x".to_vec()), &mut out).is_err());
    }

    #[test]
    fn test_encryption_data_document() {
        let metadata = EncryptionMetadata {
            key: "a2V5".to_string(),
            iv: "aXY=".to_string(),
            matdesc: "{\"smkId\":\"1\"}".to_string(),
        };
        let json = EncryptionData::new(&metadata, "AES_CBC_128").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["EncryptionMode"], "FullBlob");
        assert_eq!(value["WrappedContentKey"]["EncryptedKey"], "a2V5");
        assert_eq!(value["EncryptionAgent"]["EncryptionAlgorithm"], "AES_CBC_128");
        assert_eq!(value["ContentEncryptionIV"], "aXY=");

        let parsed = EncryptionData::parse_metadata(&json, Some(&metadata.matdesc)).unwrap();
        assert_eq!(parsed, metadata);
        assert!(EncryptionData::parse_metadata("null", None).is_err());
    }
}
