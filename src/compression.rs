//! Compression type registry / 压缩类型注册表
//!
//! Every codec a source file may already be compressed with, whether the
//! stage accepts it, and how to recognize it from a file name or the first
//! bytes of its content.

use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, PartialEq, Eq)]
pub struct CompressionType {
    /// Upper-case name shown in results / 结果中显示的名称
    pub name: &'static str,
    pub file_extension: &'static str,
    pub mime_type: &'static str,
    pub mime_subtypes: &'static [&'static str],
    pub is_supported: bool,
}

pub static GZIP: CompressionType = CompressionType {
    name: "GZIP",
    file_extension: ".gz",
    mime_type: "application",
    mime_subtypes: &["gzip", "x-gzip"],
    is_supported: true,
};

pub static DEFLATE: CompressionType = CompressionType {
    name: "DEFLATE",
    file_extension: ".deflate",
    mime_type: "application",
    mime_subtypes: &["zlib", "deflate"],
    is_supported: true,
};

pub static RAW_DEFLATE: CompressionType = CompressionType {
    name: "RAW_DEFLATE",
    file_extension: ".raw_deflate",
    mime_type: "application",
    mime_subtypes: &["raw_deflate"],
    is_supported: true,
};

pub static BZIP2: CompressionType = CompressionType {
    name: "BZIP2",
    file_extension: ".bz2",
    mime_type: "application",
    mime_subtypes: &["bzip2", "x-bzip2", "x-bz2", "x-bzip", "bz2"],
    is_supported: true,
};

pub static ZSTD: CompressionType = CompressionType {
    name: "ZSTD",
    file_extension: ".zst",
    mime_type: "application",
    mime_subtypes: &["zstd"],
    is_supported: true,
};

pub static BROTLI: CompressionType = CompressionType {
    name: "BROTLI",
    file_extension: ".br",
    mime_type: "application",
    mime_subtypes: &["br", "x-br"],
    is_supported: true,
};

pub static LZIP: CompressionType = CompressionType {
    name: "LZIP",
    file_extension: ".lz",
    mime_type: "application",
    mime_subtypes: &["lzip", "x-lzip"],
    is_supported: false,
};

pub static LZMA: CompressionType = CompressionType {
    name: "LZMA",
    file_extension: ".lzma",
    mime_type: "application",
    mime_subtypes: &["lzma", "x-lzma"],
    is_supported: false,
};

pub static LZO: CompressionType = CompressionType {
    name: "LZO",
    file_extension: ".lzo",
    mime_type: "application",
    mime_subtypes: &["lzop", "x-lzop"],
    is_supported: false,
};

pub static XZ: CompressionType = CompressionType {
    name: "XZ",
    file_extension: ".xz",
    mime_type: "application",
    mime_subtypes: &["xz", "x-xz"],
    is_supported: false,
};

pub static COMPRESS: CompressionType = CompressionType {
    name: "COMPRESS",
    file_extension: ".Z",
    mime_type: "application",
    mime_subtypes: &["compress", "x-compress"],
    is_supported: false,
};

pub static PARQUET: CompressionType = CompressionType {
    name: "PARQUET",
    file_extension: ".parquet",
    mime_type: "snowflake",
    mime_subtypes: &["parquet"],
    is_supported: true,
};

pub static ORC: CompressionType = CompressionType {
    name: "ORC",
    file_extension: ".orc",
    mime_type: "snowflake",
    mime_subtypes: &["orc"],
    is_supported: true,
};

pub static COMPRESSION_TYPES: [&CompressionType; 13] = [
    &GZIP, &DEFLATE, &RAW_DEFLATE, &BZIP2, &ZSTD, &BROTLI,
    &LZIP, &LZMA, &LZO, &XZ, &COMPRESS, &PARQUET, &ORC,
];

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Look up a codec by a declared MIME subtype (case-insensitive) / 按MIME子类型查找
pub fn lookup_by_mime_subtype(subtype: &str) -> Option<&'static CompressionType> {
    let subtype = subtype.to_lowercase();
    COMPRESSION_TYPES
        .iter()
        .copied()
        .find(|t| t.mime_subtypes.contains(&subtype.as_str()))
}

/// Look up a codec by its registry name, e.g. "GZIP" / 按名称查找
pub fn lookup_by_name(name: &str) -> Option<&'static CompressionType> {
    COMPRESSION_TYPES
        .iter()
        .copied()
        .find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Detect compression from the file extension / 根据扩展名检测
pub fn detect_from_extension(file_name: &str) -> Option<&'static CompressionType> {
    let dot = file_name.rfind('.')?;
    let ext = &file_name[dot..];
    // ".Z" and ".z" differ, so exact matches win
    COMPRESSION_TYPES
        .iter()
        .copied()
        .find(|t| t.file_extension == ext)
        .or_else(|| {
            COMPRESSION_TYPES
                .iter()
                .copied()
                .filter(|t| t.name != COMPRESS.name)
                .find(|t| t.file_extension.eq_ignore_ascii_case(ext))
        })
}

/// Detect compression from the first bytes of the content / 根据魔数检测
pub fn detect_from_magic(header: &[u8]) -> Option<&'static CompressionType> {
    if header.starts_with(b"PAR1") {
        Some(&PARQUET)
    } else if header.starts_with(b"ORC") {
        Some(&ORC)
    } else if header.starts_with(&ZSTD_MAGIC) {
        Some(&ZSTD)
    } else {
        None
    }
}

/// Detect compression of an in-memory source / 检测内存数据的压缩类型
pub fn detect_bytes(file_name: &str, data: &[u8]) -> Option<&'static CompressionType> {
    detect_from_extension(file_name).or_else(|| detect_from_magic(&data[..data.len().min(4)]))
}

/// Detect compression of a file on disk / 检测文件的压缩类型
pub fn detect_file(path: &Path) -> std::io::Result<Option<&'static CompressionType>> {
    let name = path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(found) = detect_from_extension(&name) {
        return Ok(Some(found));
    }

    let mut header = [0u8; 4];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(detect_from_magic(&header[..read]))
}
