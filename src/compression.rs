use crate::error::{AgentError, Result};
use clap::ValueEnum;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const WRITE_BUF_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum Codec {
    None,
    Gzip,
    Zstd,
}

impl Codec {
    /// Guess the codec from the archive name the orchestrator handed us.
    pub fn from_extension(path: &Path) -> Codec {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Codec::Gzip,
            Some("zst") => Codec::Zstd,
            _ => Codec::None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CompressionSettings {
    pub codec: Codec,
    pub level: i32,
}

impl CompressionSettings {
    pub fn none() -> Self {
        Self {
            codec: Codec::None,
            level: 0,
        }
    }

    pub fn new(codec: Codec, level: i32) -> Result<Self> {
        let ok = match codec {
            Codec::None => true,
            Codec::Gzip => (0..=9).contains(&level),
            Codec::Zstd => zstd::compression_level_range().contains(&level),
        };
        if !ok {
            return Err(AgentError::Config(format!(
                "compression level {level} is out of range for {codec:?}"
            )));
        }
        Ok(Self { codec, level })
    }
}

enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

/// Write side of the archive.
///
/// Everything written is counted in logical (uncompressed) bytes, which is
/// the coordinate space of the TOC. `finish()` must be called to emit the
/// codec trailer; dropping a sink leaves a truncated archive behind.
pub struct ArchiveSink<W: Write> {
    encoder: Encoder<BufWriter<W>>,
    committed: u64,
}

impl ArchiveSink<File> {
    pub fn create(path: &Path, settings: CompressionSettings) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| AgentError::io(format!("Failed to create data file {}", path.display()), e))?;
        Self::new(file, settings)
    }
}

impl<W: Write> ArchiveSink<W> {
    pub fn new(inner: W, settings: CompressionSettings) -> Result<Self> {
        let buffered = BufWriter::with_capacity(WRITE_BUF_SIZE, inner);
        let encoder = match settings.codec {
            Codec::None => Encoder::Plain(buffered),
            Codec::Gzip => Encoder::Gzip(GzEncoder::new(
                buffered,
                flate2::Compression::new(settings.level as u32),
            )),
            Codec::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(buffered, settings.level)
                    .map_err(|e| AgentError::compression("starting zstd encoder", e))?,
            ),
        };

        Ok(Self {
            encoder,
            committed: 0,
        })
    }

    /// Logical bytes accepted so far.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Flush the codec trailer and all buffers, handing back the underlying
    /// writer so the caller decides when it is closed.
    pub fn finish(self) -> Result<W> {
        let buffered = match self.encoder {
            Encoder::Plain(w) => w,
            Encoder::Gzip(e) => e
                .finish()
                .map_err(|e| AgentError::compression("finalizing gzip stream", e))?,
            Encoder::Zstd(e) => e
                .finish()
                .map_err(|e| AgentError::compression("finalizing zstd stream", e))?,
        };

        buffered
            .into_inner()
            .map_err(|e| AgentError::compression("flushing data file", e.into_error()))
    }
}

impl<W: Write> Write for ArchiveSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.encoder {
            Encoder::Plain(w) => w.write(buf)?,
            Encoder::Gzip(w) => w.write(buf)?,
            Encoder::Zstd(w) => w.write(buf)?,
        };
        self.committed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
            Encoder::Zstd(w) => w.flush(),
        }
    }
}

enum Decoder<R: Read> {
    Plain(BufReader<R>),
    Gzip(MultiGzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

/// Read side of the archive: one decompression pipeline for the whole run.
///
/// Compressed streams can't seek, so the source only ever moves forward;
/// `skip_to` reads and throws away bytes to reach a TOC offset.
pub struct ArchiveSource<R: Read> {
    decoder: Decoder<R>,
    position: u64,
}

impl ArchiveSource<File> {
    pub fn open_file(path: &Path, codec: Codec) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| AgentError::io(format!("Failed to open data file {}", path.display()), e))?;
        Self::new(file, codec)
    }
}

impl<R: Read> ArchiveSource<R> {
    pub fn new(inner: R, codec: Codec) -> Result<Self> {
        let decoder = match codec {
            Codec::None => Decoder::Plain(BufReader::new(inner)),
            Codec::Gzip => Decoder::Gzip(MultiGzDecoder::new(inner)),
            Codec::Zstd => Decoder::Zstd(
                zstd::stream::read::Decoder::new(inner)
                    .map_err(|e| AgentError::compression("starting zstd decoder", e))?,
            ),
        };

        Ok(Self {
            decoder,
            position: 0,
        })
    }

    /// Logical offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Discard bytes until `offset` is the next byte to be read.
    pub fn skip_to(&mut self, offset: u64) -> Result<u64> {
        if offset < self.position {
            return Err(AgentError::compression(
                format!("seeking back to offset {offset}"),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("stream is already at offset {}", self.position),
                ),
            ));
        }

        let want = offset - self.position;
        let skipped = io::copy(&mut self.by_ref().take(want), &mut io::sink())
            .map_err(|e| AgentError::compression(format!("skipping to offset {offset}"), e))?;

        if skipped < want {
            return Err(AgentError::compression(
                format!("skipping to offset {offset}"),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("archive ends at offset {}", self.position),
                ),
            ));
        }
        Ok(skipped)
    }

    /// Read whatever follows the last TOC range, so codec trailers get
    /// checked and a plugin feeding us is never cut off mid-write.
    /// Returns the number of trailing logical bytes.
    pub fn finish(mut self) -> Result<u64> {
        io::copy(&mut self, &mut io::sink())
            .map_err(|e| AgentError::compression("draining end of archive", e))
    }
}

impl<R: Read> Read for ArchiveSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.decoder {
            Decoder::Plain(r) => r.read(buf)?,
            Decoder::Gzip(r) => r.read(buf)?,
            Decoder::Zstd(r) => r.read(buf)?,
        };
        self.position += n as u64;
        Ok(n)
    }
}
