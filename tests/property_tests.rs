//! Property-based tests for the file-handling layer.
//!
//! Uses proptest to verify crawl ordering, permission encoding, and chunk
//! compression invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Manifest crawl properties
// ============================================================================

mod manifest_properties {
    use super::*;
    use drift_files::{ElementKind, ManifestBuilder};
    use std::collections::HashSet;
    use std::fs;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Crawl output is deduplicated and topological: every directory
        /// precedes its contents, and sizes agree with the filesystem.
        #[test]
        fn crawl_is_topological_and_deduplicated(
            paths in prop::collection::vec("[a-d]{1,3}(/[a-d]{1,3}){0,2}", 1..16),
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().join("tree");
            fs::create_dir_all(&root).unwrap();

            let mut written = 0u64;
            for (i, rel) in paths.iter().enumerate() {
                let path = root.join(rel);
                // Name collisions between files and directories are skipped;
                // the crawl only ever sees what actually landed on disk.
                if let Some(parent) = path.parent() {
                    if fs::create_dir_all(parent).is_err() {
                        continue;
                    }
                }
                if path.exists() {
                    continue;
                }
                let body = vec![b'x'; i + 1];
                if fs::write(&path, &body).is_ok() {
                    written += body.len() as u64;
                }
            }

            let manifest = ManifestBuilder::new(false).build(&[root.clone()]).unwrap();

            let mut seen = HashSet::new();
            for entry in &manifest.entries {
                prop_assert!(
                    seen.insert(entry.relative_path.clone()),
                    "duplicate entry {}",
                    entry.relative_path
                );
                if let Some((parent, _)) = entry.relative_path.rsplit_once('/') {
                    prop_assert!(
                        seen.contains(parent),
                        "{} emitted before its parent",
                        entry.relative_path
                    );
                }
            }

            prop_assert_eq!(manifest.total_size(), written);
            for entry in &manifest.entries {
                match entry.kind {
                    ElementKind::File => prop_assert_eq!(
                        entry.size,
                        fs::metadata(&entry.absolute_path).unwrap().len()
                    ),
                    _ => prop_assert_eq!(entry.size, 0),
                }
            }
        }
    }
}

// ============================================================================
// Permission encoding properties
// ============================================================================

mod permission_properties {
    use super::*;
    use drift_files::UnixMode;

    proptest! {
        /// Every 9-bit mode survives the chmod-decimal wire encoding.
        #[test]
        fn chmod_roundtrip(bits in 0u16..0o1000) {
            let mode = UnixMode::from_bits(bits);
            prop_assert_eq!(UnixMode::from_chmod(mode.to_chmod()), Some(mode));
        }

        /// A chmod decimal parses exactly when all three digits are octal.
        #[test]
        fn non_octal_digits_rejected(owner in 0u32..10, group in 0u32..10, other in 0u32..10) {
            let value = owner * 100 + group * 10 + other;
            let valid = owner < 8 && group < 8 && other < 8;
            prop_assert_eq!(UnixMode::from_chmod(value).is_some(), valid);
        }

        /// Values beyond three digits never parse.
        #[test]
        fn oversized_chmod_rejected(value in 1000u32..100_000) {
            prop_assert_eq!(UnixMode::from_chmod(value), None);
        }
    }
}

// ============================================================================
// Compression properties
// ============================================================================

mod compression_properties {
    use super::*;
    use drift_files::{compress, decompress};

    proptest! {
        /// Compression round-trips at every level under an exact-size bound.
        #[test]
        fn roundtrip_all_levels(
            data in prop::collection::vec(any::<u8>(), 0..4096),
            level in 1u32..=9,
        ) {
            let packed = compress(&data, level).unwrap();
            prop_assert_eq!(decompress(&packed, data.len()).unwrap(), data);
        }

        /// An undersized output bound errors out rather than truncating.
        #[test]
        fn tight_limit_never_truncates(data in prop::collection::vec(any::<u8>(), 1..2048)) {
            let packed = compress(&data, 6).unwrap();
            prop_assert!(decompress(&packed, data.len() - 1).is_err());
            prop_assert_eq!(decompress(&packed, data.len()).unwrap(), data);
        }
    }
}

// ============================================================================
// Executable classification properties
// ============================================================================

mod classification_properties {
    use super::*;
    use drift_files::is_executable;

    proptest! {
        /// A known executable extension wins regardless of content.
        #[test]
        fn extension_wins_over_content(
            stem in "[a-z]{1,8}",
            block in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let script = format!("{stem}.sh");
            let appimage = format!("{stem}.AppImage");
            prop_assert!(is_executable(&script, &block));
            prop_assert!(is_executable(&appimage, &block));
        }

        /// Plain names fall back to the ELF magic in the first block.
        #[test]
        fn plain_names_follow_elf_magic(
            stem in "[a-z]{1,8}",
            mut block in prop::collection::vec(any::<u8>(), 4..64),
        ) {
            let name = format!("{stem}.txt");
            block[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
            prop_assert!(is_executable(&name, &block));
            block[0] = 0;
            prop_assert!(!is_executable(&name, &block));
        }
    }
}
