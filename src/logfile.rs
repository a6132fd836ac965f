//! sd-spi-log - Rollover debug log core
//!
//! A small log-structured write path: records are appended to one active
//! file, and once a record would push the file past a size threshold the
//! file is archived under the next free numbered name and a fresh active
//! file is started.
//!
//! The core never touches a filesystem directly. Everything goes through
//! the [`FileOps`] trait, which is the seam that lets the whole state
//! machine run against a fake filesystem on a host. The core also never
//! stores file handles - the caller owns the concrete filesystem binding
//! and lends it to each call.

use core::fmt::Debug;
use core::fmt::Write as _;

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// Capacity of the active file name, bytes.
pub const MAX_FILE_NAME_LEN: usize = 32;
/// Capacity of the archive name prefix, bytes.
pub const MAX_PREFIX_LEN: usize = 16;

/// Archive indices are probed linearly and run out at 9999 - the names are
/// zero-padded to four digits.
const MAX_ARCHIVE_INDEX: u16 = 9999;

/// The file primitives the log core needs.
///
/// All operations act on the implementor's single current file handle where
/// applicable (`open_append`, `close`, `write`, `flush`) or on names
/// (`create_new`, `rename`, `exists`, `size_of`). The implementor decides
/// what a name means - typically a path on the FAT volume the block-device
/// half of this crate exposes.
pub trait FileOps {
    /// The error type of the underlying filesystem. Must be debug formattable.
    type Error: Debug;

    /// Open the named file for appending. The file exists.
    fn open_append(&mut self, name: &str) -> Result<(), Self::Error>;
    /// Create the named file, empty. The file does not exist.
    fn create_new(&mut self, name: &str) -> Result<(), Self::Error>;
    /// Close the currently open file.
    fn close(&mut self) -> Result<(), Self::Error>;
    /// Append bytes to the currently open file.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Commit buffered data of the currently open file.
    fn flush(&mut self) -> Result<(), Self::Error>;
    /// Rename a file. The destination does not exist.
    fn rename(&mut self, old: &str, new: &str) -> Result<(), Self::Error>;
    /// Does this name exist?
    fn exists(&mut self, name: &str) -> Result<bool, Self::Error>;
    /// Size of the named file in bytes.
    fn size_of(&mut self, name: &str) -> Result<u32, Self::Error>;
}

/// The possible errors the log core can generate. Each failing filesystem
/// step keeps its identity - a failed rename leaves the log in a different
/// recoverable state than a failed create, and callers get to tell them
/// apart.
#[derive(Debug, PartialEq)]
pub enum Error<E>
where
    E: Debug,
{
    /// An existence query failed
    Exists(E),
    /// Creating a file failed
    Create(E),
    /// Opening the active file for append failed
    Open(E),
    /// Appending record bytes failed
    Write(E),
    /// Renaming the active file to its archive name failed
    Rename(E),
    /// All 9999 archive names are taken
    ArchiveNamesExhausted,
    /// The archive name did not fit its buffer
    FormatArchiveName,
}

/// State of the rollover log.
///
/// Construction is pure - no filesystem traffic happens until the first
/// write. There are no dynamic resources; dropping this is always safe.
pub struct LogFile {
    rollover_threshold_bytes: u32,
    current_file_size_bytes: u32,
    next_archive_index: u16,
    active_file_is_open: bool,
    active_file_name: heapless::String<MAX_FILE_NAME_LEN>,
    archive_file_prefix: heapless::String<MAX_PREFIX_LEN>,
}

/// Copy a name into a fixed-capacity string, truncating if it does not fit.
fn bounded_name<const N: usize>(source: &str) -> heapless::String<N> {
    let mut name = heapless::String::new();
    for c in source.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// Format `"<prefix><zero-padded-4-digit-index>.log"`, e.g. `debug_0001.log`.
fn format_archive_name(
    prefix: &str,
    index: u16,
) -> Result<heapless::String<MAX_FILE_NAME_LEN>, core::fmt::Error> {
    let mut name = heapless::String::new();
    write!(name, "{}{:04}.log", prefix, index)?;
    Ok(name)
}

impl LogFile {
    /// Set up the log state. Pure - nothing is opened or created here, so
    /// this can run before the filesystem is even mounted.
    ///
    /// The first archive produced will be `"<archive_prefix>0001.log"`.
    /// Names longer than the fixed capacities are truncated.
    pub fn new(rollover_threshold_bytes: u32, active_file_name: &str, archive_prefix: &str) -> Self {
        LogFile {
            rollover_threshold_bytes,
            current_file_size_bytes: 0,
            next_archive_index: 1,
            active_file_is_open: false,
            active_file_name: bounded_name(active_file_name),
            archive_file_prefix: bounded_name(archive_prefix),
        }
    }

    /// The active file name as stored (possibly truncated).
    pub fn active_file_name(&self) -> &str {
        &self.active_file_name
    }

    /// Bytes currently tracked in the active file.
    pub fn current_file_size_bytes(&self) -> u32 {
        self.current_file_size_bytes
    }

    /// Whether the active file is open.
    pub fn is_open(&self) -> bool {
        self.active_file_is_open
    }

    /// Make sure the active file exists and is open for append. A no-op if
    /// it already is.
    ///
    /// After opening, the size counter is resynchronized from the
    /// filesystem. The process may have restarted with a non-empty active
    /// file already on disk; assuming a fresh file here would let the file
    /// grow past the threshold after every crash. The size query itself is
    /// best-effort - if it fails we fall back to zero.
    pub fn open_if_needed<F>(&mut self, file_ops: &mut F) -> Result<(), Error<F::Error>>
    where
        F: FileOps,
    {
        if self.active_file_is_open {
            return Ok(());
        }

        let exists = file_ops
            .exists(&self.active_file_name)
            .map_err(Error::Exists)?;
        if !exists {
            file_ops
                .create_new(&self.active_file_name)
                .map_err(Error::Create)?;
        }

        file_ops
            .open_append(&self.active_file_name)
            .map_err(Error::Open)?;
        self.active_file_is_open = true;

        match file_ops.size_of(&self.active_file_name) {
            Ok(size) => self.current_file_size_bytes = size,
            Err(_e) => {
                warn!("size query failed, tracking from zero");
                self.current_file_size_bytes = 0;
            }
        }

        Ok(())
    }

    /// Append one record.
    ///
    /// A zero-length record is a successful no-op. The rollover check runs
    /// before the write, not after, so no single file is ever allowed to
    /// exceed the threshold: if this record would push the active file past
    /// it, the file is archived first and the record opens the fresh file.
    pub fn write_record<F>(&mut self, file_ops: &mut F, bytes: &[u8]) -> Result<(), Error<F::Error>>
    where
        F: FileOps,
    {
        if bytes.is_empty() {
            return Ok(());
        }

        self.open_if_needed(file_ops)?;

        if self.current_file_size_bytes + bytes.len() as u32 > self.rollover_threshold_bytes {
            self.roll_over(file_ops)?;
        }

        file_ops.write(bytes).map_err(Error::Write)?;
        self.current_file_size_bytes += bytes.len() as u32;

        Ok(())
    }

    /// Flush and close the active file. Idempotent: a second call is a
    /// successful no-op. Flush and close failures are deliberately ignored -
    /// there is nothing recoverable to do with them at shutdown.
    pub fn force_flush_and_close<F>(&mut self, file_ops: &mut F) -> Result<(), Error<F::Error>>
    where
        F: FileOps,
    {
        if !self.active_file_is_open {
            return Ok(());
        }

        file_ops.flush().ok();
        file_ops.close().ok();
        self.active_file_is_open = false;

        Ok(())
    }

    /// Find the first archive name not already on disk, starting the probe
    /// at `next_archive_index`. The index is advanced past the chosen name
    /// so later rollovers in this process never re-probe consumed names.
    fn find_next_available_archive_name<F>(
        &mut self,
        file_ops: &mut F,
    ) -> Result<heapless::String<MAX_FILE_NAME_LEN>, Error<F::Error>>
    where
        F: FileOps,
    {
        for index in self.next_archive_index..=MAX_ARCHIVE_INDEX {
            let candidate = format_archive_name(&self.archive_file_prefix, index)
                .map_err(|_e| Error::FormatArchiveName)?;

            let taken = file_ops.exists(&candidate).map_err(Error::Exists)?;
            if !taken {
                self.next_archive_index = index + 1;
                return Ok(candidate);
            }
        }

        Err(Error::ArchiveNamesExhausted)
    }

    /// Archive the active file and start a fresh one.
    ///
    /// Close is best-effort; the rename, create and reopen each surface
    /// their own failure because they leave the log in distinct states
    /// (e.g. "records are stranded under the archive name" vs "no active
    /// file exists at all").
    fn roll_over<F>(&mut self, file_ops: &mut F) -> Result<(), Error<F::Error>>
    where
        F: FileOps,
    {
        debug!(
            "rolling over at {} bytes",
            self.current_file_size_bytes
        );

        if self.active_file_is_open {
            file_ops.flush().ok();
            file_ops.close().ok();
            self.active_file_is_open = false;
        }

        let archive_name = self.find_next_available_archive_name(file_ops)?;

        file_ops
            .rename(&self.active_file_name, &archive_name)
            .map_err(Error::Rename)?;

        file_ops
            .create_new(&self.active_file_name)
            .map_err(Error::Create)?;
        file_ops
            .open_append(&self.active_file_name)
            .map_err(Error::Open)?;

        self.active_file_is_open = true;
        self.current_file_size_bytes = 0;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn archive_name_is_zero_padded() {
        assert_eq!(
            format_archive_name("debug_", 1).unwrap().as_str(),
            "debug_0001.log"
        );
        assert_eq!(
            format_archive_name("debug_", 9999).unwrap().as_str(),
            "debug_9999.log"
        );
    }

    #[test]
    fn long_names_are_truncated_not_rejected() {
        let log = LogFile::new(10, "a-very-long-name-well-over-the-cap.log", "p");
        assert_eq!(log.active_file_name().len(), MAX_FILE_NAME_LEN);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
