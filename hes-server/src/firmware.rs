//! # firmware
//!
//! Firmware file ownership for one FUOTA session (§4.6 phase 1, §5): opened
//! once at `OpenFile`, read page/subpage-at-a-time during `ImageTransfer`,
//! rewound for the whole-file CRC at `CrcCompute`, closed on any terminal
//! transition. Grounded on `original_source/HES/src/fuota.cpp`'s own
//! `fopen`/`fseek`/`fread` firmware-file handling (building the
//! `<base>/FUOTA/RF/<gateway-id>/<filename>` path, `fs::exists()` guard
//! before open).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use hes_core::error::FirmwareIoError;
use hes_core::fuota::crc16;

/// Builds the firmware path named in §4.6 step 1.
pub fn path_for(base_dir: &str, gateway_id: &str, filename: &str) -> String {
    format!("{base_dir}/FUOTA/RF/{gateway_id}/{filename}")
}

pub struct FirmwareFile {
    file: File,
    pub size: u64,
    cached_crc: Option<u16>,
}

impl FirmwareFile {
    /// Opens the firmware image at `path`, failing with `NotFound` if the
    /// path doesn't exist and `Open` for any other open-time error.
    pub fn open(path: &str) -> Result<Self, FirmwareIoError> {
        let p = std::path::Path::new(path);
        if !p.exists() {
            return Err(FirmwareIoError::NotFound);
        }
        let file = File::open(p).map_err(|_| FirmwareIoError::Open)?;
        let size = file.metadata().map_err(|_| FirmwareIoError::Open)?.len();
        Ok(Self { file, size, cached_crc: None })
    }

    /// Reads up to `max_len` bytes starting at `offset`, seeking there first.
    /// Returns fewer bytes than `max_len` only at end of file (the "min-payload
    /// on the last subpage" case of §4.6 step 8) — an empty read at a non-EOF
    /// offset is `SizeMismatch`.
    pub fn read_at(&mut self, offset: u64, max_len: usize) -> Result<Vec<u8>, FirmwareIoError> {
        self.file.seek(SeekFrom::Start(offset)).map_err(|_| FirmwareIoError::Read)?;
        let remaining = self.size.saturating_sub(offset);
        let want = (max_len as u64).min(remaining) as usize;
        let mut buf = vec![0u8; want];
        if want > 0 {
            self.file.read_exact(&mut buf).map_err(|_| FirmwareIoError::Read)?;
        } else if offset < self.size {
            return Err(FirmwareIoError::SizeMismatch);
        }
        Ok(buf)
    }

    /// CRC-16/0xA001 over the entire file, rewinding first. Cached after the
    /// first call so a retried `CrcCompute` phase doesn't re-read the file
    /// (§9 Testable Property 7).
    pub fn whole_file_crc16(&mut self) -> Result<u16, FirmwareIoError> {
        if let Some(crc) = self.cached_crc {
            return Ok(crc);
        }
        self.file.seek(SeekFrom::Start(0)).map_err(|_| FirmwareIoError::Read)?;
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut buf).map_err(|_| FirmwareIoError::Read)?;
        let crc = crc16(&buf);
        self.cached_crc = Some(crc);
        Ok(crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!("hes_fw_test_{:p}", bytes.as_ptr()));
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn open_missing_file_is_not_found() {
        assert!(matches!(
            FirmwareFile::open("/nonexistent/path/fw.bin"),
            Err(FirmwareIoError::NotFound)
        ));
    }

    #[test]
    fn read_at_clamps_to_remaining_bytes_at_eof() {
        let path = write_temp(b"0123456789");
        let mut fw = FirmwareFile::open(&path).unwrap();
        let chunk = fw.read_at(8, 16).unwrap();
        assert_eq!(chunk, b"89");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn crc_is_cached_across_calls() {
        let path = write_temp(b"firmware payload bytes");
        let mut fw = FirmwareFile::open(&path).unwrap();
        let first = fw.whole_file_crc16().unwrap();
        let second = fw.whole_file_crc16().unwrap();
        assert_eq!(first, second);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn path_for_builds_dcu_style_layout() {
        assert_eq!(path_for("/var/lib/hes", "GW1", "meter.bin"), "/var/lib/hes/FUOTA/RF/GW1/meter.bin");
    }
}
