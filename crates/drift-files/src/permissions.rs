//! Unix permission mapping and executable classification.
//!
//! Permissions travel on the wire as chmod-style decimals (644, 755) and are
//! held internally as the 9-bit rwx model. Regular files are classified as
//! executable by extension first, then by sniffing the ELF magic number in
//! the first payload block.

/// ELF magic number prefix
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// File extensions that mark a file executable without content sniffing
const EXECUTABLE_EXTENSIONS: &[&str] = &["sh", "bin", "run", "appimage", "exe", "bat", "cmd"];

/// 9-bit rwx permission set (owner/group/other)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixMode(u16);

impl UnixMode {
    /// Mask covering all nine permission bits
    pub const MASK: u16 = 0o777;

    /// Default mode for regular files (rw-r--r--)
    pub const FILE_DEFAULT: UnixMode = UnixMode(0o644);

    /// Default mode for executables and directories (rwxr-xr-x)
    pub const EXEC_DEFAULT: UnixMode = UnixMode(0o755);

    /// Build from raw permission bits, masking to the 9-bit range
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    /// Raw 9-bit permission value (0..=511)
    #[must_use]
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Parse a chmod-style decimal (e.g. `644` meaning `rw-r--r--`)
    ///
    /// Each decimal digit is one octal triplet; digits above 7 or more than
    /// three digits make the value malformed.
    #[must_use]
    pub fn from_chmod(value: u32) -> Option<Self> {
        if value > 777 {
            return None;
        }
        let (owner, group, other) = (value / 100, value / 10 % 10, value % 10);
        if owner > 7 || group > 7 || other > 7 {
            return None;
        }
        Some(Self(((owner << 6) | (group << 3) | other) as u16))
    }

    /// Encode as a chmod-style decimal (`0o644` becomes `644`)
    #[must_use]
    pub fn to_chmod(&self) -> u32 {
        let bits = u32::from(self.0);
        ((bits >> 6) & 0o7) * 100 + ((bits >> 3) & 0o7) * 10 + (bits & 0o7)
    }

    /// True if any execute bit is set
    #[must_use]
    pub fn any_execute(&self) -> bool {
        self.0 & 0o111 != 0
    }
}

impl Default for UnixMode {
    fn default() -> Self {
        Self::FILE_DEFAULT
    }
}

impl std::fmt::Display for UnixMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03o}", self.0)
    }
}

/// Classify a file as executable from its name and first payload block
///
/// The extension allow-list wins; otherwise the first four bytes are checked
/// for the ELF magic number. Called once per file, on the first block.
#[must_use]
pub fn is_executable(file_name: &str, first_block: &[u8]) -> bool {
    let by_extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| {
            EXECUTABLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false);

    by_extension || first_block.starts_with(&ELF_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip_exhaustive() {
        for v in 0u16..512 {
            assert_eq!(UnixMode::from_bits(v).bits(), v);
        }
    }

    #[test]
    fn chmod_roundtrip_exhaustive() {
        for owner in 0u32..8 {
            for group in 0u32..8 {
                for other in 0u32..8 {
                    let chmod = owner * 100 + group * 10 + other;
                    let mode = UnixMode::from_chmod(chmod).unwrap();
                    assert_eq!(mode.to_chmod(), chmod);
                }
            }
        }
    }

    #[test]
    fn chmod_rejects_non_octal_digits() {
        assert!(UnixMode::from_chmod(648).is_none());
        assert!(UnixMode::from_chmod(800).is_none());
        assert!(UnixMode::from_chmod(999).is_none());
        assert!(UnixMode::from_chmod(1000).is_none());
    }

    #[test]
    fn chmod_maps_to_expected_bits() {
        assert_eq!(UnixMode::from_chmod(644).unwrap().bits(), 0o644);
        assert_eq!(UnixMode::from_chmod(755).unwrap().bits(), 0o755);
        assert_eq!(UnixMode::from_chmod(0).unwrap().bits(), 0);
    }

    #[test]
    fn execute_bit_detection() {
        assert!(UnixMode::from_bits(0o755).any_execute());
        assert!(UnixMode::from_bits(0o100).any_execute());
        assert!(!UnixMode::from_bits(0o644).any_execute());
    }

    #[test]
    fn elf_magic_classifies_executable() {
        assert!(is_executable("payload", &[0x7F, b'E', b'L', b'F', 0, 0]));
        assert!(is_executable("payload", &[0x7F, b'E', b'L', b'F']));
        assert!(!is_executable("payload", &[0x7F, b'E', b'L']));
        assert!(!is_executable("payload", b"#!/usr/bin/env python"));
        assert!(!is_executable("payload", &[]));
    }

    #[test]
    fn extension_classifies_executable() {
        assert!(is_executable("install.sh", b""));
        assert!(is_executable("Setup.EXE", b""));
        assert!(is_executable("app.AppImage", b""));
        assert!(!is_executable("notes.txt", b""));
        assert!(!is_executable("archive.tar.gz", b""));
        assert!(!is_executable("no_extension", b""));
    }

    #[test]
    fn display_is_octal() {
        assert_eq!(UnixMode::from_bits(0o644).to_string(), "644");
        assert_eq!(UnixMode::from_bits(0o7).to_string(), "007");
    }
}
