use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Size of the length trailer at the very end of a carrier executable.
pub const TRAILER_LEN: u64 = 8;

/// Payloads are streamed in chunks of this size, never loaded as a whole.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error(
        "corrupt carrier {}: trailer announces {payload_len} payload bytes in a {file_size} byte file",
        path.display()
    )]
    CorruptFormat {
        path: PathBuf,
        payload_len: u64,
        file_size: u64,
    },
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FrameError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> FrameError + '_ {
        move |source| FrameError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Location of the payload inside a carrier executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSpan {
    pub offset: u64,
    pub len: u64,
}

/// Appends the contents of `payload` to `carrier` followed by the payload
/// length as a little endian u64.
///
/// The carrier grows by `len(payload) + 8` bytes. A crash halfway leaves a
/// broken carrier, which is fine for a build step.
pub fn append(carrier: &Path, payload: &Path) -> Result<u64, FrameError> {
    require_file(carrier)?;
    require_file(payload)?;

    let mut source = File::open(payload).map_err(FrameError::io(payload))?;
    let file = OpenOptions::new()
        .append(true)
        .open(carrier)
        .map_err(FrameError::io(carrier))?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);

    let written = io::copy(&mut source, &mut writer).map_err(FrameError::io(carrier))?;
    writer
        .write_u64::<LE>(written)
        .map_err(FrameError::io(carrier))?;
    let file = writer
        .into_inner()
        .map_err(|err| FrameError::io(carrier)(err.into_error()))?;
    file.sync_all().map_err(FrameError::io(carrier))?;

    log::debug!(
        "appended {} payload bytes to {}",
        written,
        carrier.display()
    );

    Ok(written)
}

/// Reads the trailer of `carrier` and validates it against the file size.
pub fn payload_span(carrier: &Path) -> Result<PayloadSpan, FrameError> {
    require_file(carrier)?;
    let mut file = File::open(carrier).map_err(FrameError::io(carrier))?;
    read_span(&mut file, carrier)
}

fn read_span(file: &mut File, path: &Path) -> Result<PayloadSpan, FrameError> {
    let file_size = file.metadata().map_err(FrameError::io(path))?.len();
    let corrupt = |payload_len| FrameError::CorruptFormat {
        path: path.to_path_buf(),
        payload_len,
        file_size,
    };

    if file_size < TRAILER_LEN {
        return Err(corrupt(0));
    }

    file.seek(SeekFrom::Start(file_size - TRAILER_LEN))
        .map_err(FrameError::io(path))?;
    let payload_len = file.read_u64::<LE>().map_err(FrameError::io(path))?;

    // A length that does not fit in front of the trailer would put the start before offset 0.
    let offset = (file_size - TRAILER_LEN)
        .checked_sub(payload_len)
        .ok_or_else(|| corrupt(payload_len))?;

    Ok(PayloadSpan {
        offset,
        len: payload_len,
    })
}

/// Copies the payload of `carrier` into a newly created file at `destination`.
///
/// The carrier itself is never modified, so this can be called any number of
/// times.
pub fn extract(carrier: &Path, destination: &Path) -> Result<PayloadSpan, FrameError> {
    require_file(carrier)?;
    let mut file = File::open(carrier).map_err(FrameError::io(carrier))?;
    let span = read_span(&mut file, carrier)?;

    file.seek(SeekFrom::Start(span.offset))
        .map_err(FrameError::io(carrier))?;
    copy_exact(&mut file, carrier, span.len, destination)?;

    log::debug!(
        "extracted {} payload bytes from {} to {}",
        span.len,
        carrier.display(),
        destination.display()
    );

    Ok(span)
}

/// Writes the original program in front of the payload to `destination`,
/// producing a carrier-free copy of the executable.
pub fn copy_program_image(carrier: &Path, destination: &Path) -> Result<u64, FrameError> {
    require_file(carrier)?;
    let mut file = File::open(carrier).map_err(FrameError::io(carrier))?;
    let span = read_span(&mut file, carrier)?;

    file.seek(SeekFrom::Start(0))
        .map_err(FrameError::io(carrier))?;
    copy_exact(&mut file, carrier, span.offset, destination)?;

    Ok(span.offset)
}

fn copy_exact(
    source: &mut File,
    source_path: &Path,
    len: u64,
    destination: &Path,
) -> Result<(), FrameError> {
    let target = File::create(destination).map_err(FrameError::io(destination))?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, target);
    let mut remaining = len;
    let mut chunk = vec![0u8; CHUNK_SIZE];

    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        source
            .read_exact(&mut chunk[..want])
            .map_err(FrameError::io(source_path))?;
        writer
            .write_all(&chunk[..want])
            .map_err(FrameError::io(destination))?;
        remaining -= want as u64;
    }

    writer.flush().map_err(FrameError::io(destination))?;
    Ok(())
}

fn require_file(path: &Path) -> Result<(), FrameError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(FrameError::NotFound(path.to_path_buf()))
    }
}
