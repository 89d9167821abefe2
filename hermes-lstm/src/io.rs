use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Plain,
    Gzip,
    Zstd,
}

fn codec_for(path: &Path) -> Codec {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "gz" | "gzip" => Codec::Gzip,
        "zst" | "zstd" => Codec::Zstd,
        _ => Codec::Plain,
    }
}

/// Opens a file and returns a buffered reader, automatically decompressing
/// based on file extension (.gz, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let reader: Box<dyn Read> = match codec_for(path) {
        Codec::Gzip => Box::new(GzDecoder::new(file)),
        Codec::Zstd => Box::new(zstd::Decoder::new(file)?),
        Codec::Plain => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Reads entire file content as string, automatically decompressing if needed.
pub fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = open_file(path)?;
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    Ok(content)
}

/// Writer counterpart of [`open_file`]. Call [`FileWriter::finish`] to flush
/// the compressed trailer.
pub enum FileWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
}

/// Creates (or truncates) a file, compressing based on file extension.
pub fn create_file<P: AsRef<Path>>(path: P) -> Result<FileWriter> {
    let path = path.as_ref();
    let file = BufWriter::new(File::create(path)?);

    Ok(match codec_for(path) {
        Codec::Gzip => FileWriter::Gzip(GzEncoder::new(file, Compression::default())),
        Codec::Zstd => FileWriter::Zstd(zstd::Encoder::new(file, 0)?),
        Codec::Plain => FileWriter::Plain(file),
    })
}

impl FileWriter {
    pub fn finish(self) -> Result<()> {
        let mut inner = match self {
            FileWriter::Plain(w) => w,
            FileWriter::Gzip(e) => e.finish()?,
            FileWriter::Zstd(e) => e.finish()?,
        };
        inner.flush()?;
        Ok(())
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Plain(w) => w.write(buf),
            FileWriter::Gzip(e) => e.write(buf),
            FileWriter::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Plain(w) => w.flush(),
            FileWriter::Gzip(e) => e.flush(),
            FileWriter::Zstd(e) => e.flush(),
        }
    }
}
