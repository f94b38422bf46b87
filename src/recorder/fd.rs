use flate2::{write::GzEncoder, Compression};
use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

/// Capture sink file, plain or gzip-compressed.
pub enum FileDescriptor {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl FileDescriptor {
    pub fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let fd = File::create(path)?;

        Ok(if gzip {
            Self::Gzip(GzEncoder::new(fd, Compression::new(5)))
        } else {
            Self::Plain(fd)
        })
    }

    /// Terminates the sink. The gzip trailer is only valid after this.
    pub fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut fd) => fd.flush(),
            Self::Gzip(gz) => {
                let mut fd = gz.finish()?;
                fd.flush()
            },
        }
    }
}

impl Write for FileDescriptor {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(data),
            Self::Gzip(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}
