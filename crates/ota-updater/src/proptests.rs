//! Property-based tests for ota-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated packages and chunkings.
//!
//! # Properties Tested
//!
//! - Chunking independence: any split of a package yields the same result
//!   and the same written images as a single-chunk feed
//! - Corruption detection: flipping a body byte of an entry with a declared
//!   CRC always fails with a checksum mismatch
//! - Name handling: directory prefixes are stripped from entry names

#![cfg(test)]

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use crate::backend::{FlashBackend, MemoryBackend};
use crate::commit::CommitTimeoutStore;
use crate::driver::{Driver, DriverOptions, UpdateResult, UpdateState};
use crate::error::UpdateError;
use crate::events::StatusBus;
use crate::input::InputBuffer;
use crate::manifest::FirmwareInfo;
use crate::package::PackageBuilder;

// =============================================================================
// Generators
// =============================================================================

/// Generate entry bodies (0 to 4KB).
fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

/// Generate chunk sizes used to split a package.
fn arb_chunk_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..200, 1..64)
}

/// Generate a directory prefix such as `a/bb/`.
fn arb_prefix() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 0..4).prop_map(|parts| {
        parts.iter().map(|p| format!("{p}/")).collect::<String>()
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn package(bodies: &[Vec<u8>], descriptors: bool) -> Vec<u8> {
    let mut builder = PackageBuilder::new(json!({
        "name": "app",
        "platform": "esp32",
        "version": "2.0.0",
        "build_id": "b2",
        "parts": {"app": {"src": "fw0.bin"}}
    }))
    .with_descriptors(descriptors);
    for (i, body) in bodies.iter().enumerate() {
        builder = builder.entry(&format!("fw{i}.bin"), body);
    }
    builder.build()
}

struct Run {
    result: Result<UpdateResult, String>,
    state: UpdateState,
    files: Vec<(String, Vec<u8>)>,
}

/// Feed `data` split at the given chunk sizes (the rest in one go).
fn run(data: &[u8], chunk_sizes: &[usize]) -> Run {
    let dir = TempDir::new().unwrap();
    let backend = MemoryBackend::new();
    let options = DriverOptions {
        firmware: FirmwareInfo {
            platform: "esp32".to_string(),
            version: "1.0.0".to_string(),
            build_id: "b1".to_string(),
        },
        ignore_same_version: true,
        max_manifest_size: 64 * 1024,
        archive_size: Some(data.len() as u64),
        commit_store: CommitTimeoutStore::new(dir.path().join("updater.dat")),
    };
    let mut driver = Driver::new(
        backend.create_context().unwrap(),
        options,
        StatusBus::default(),
    );
    let mut buffer = InputBuffer::new();

    let mut rest = data;
    let mut result = Ok(UpdateResult::Pending);
    for &size in chunk_sizes.iter().chain(std::iter::once(&usize::MAX)) {
        if rest.is_empty() {
            break;
        }
        let (chunk, tail) = rest.split_at(size.min(rest.len()));
        rest = tail;
        result = driver
            .process_chunk(&mut buffer, chunk)
            .map_err(|e| e.to_string());
        if result.is_err() {
            break;
        }
    }

    let files = backend
        .file_names()
        .into_iter()
        .map(|name| {
            let body = backend.file(&name).unwrap_or_default();
            (name, body)
        })
        .collect();
    Run {
        result,
        state: driver.state(),
        files,
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_chunking_does_not_change_outcome(
        bodies in prop::collection::vec(arb_body(), 1..4),
        descriptors in any::<bool>(),
        chunk_sizes in arb_chunk_sizes(),
    ) {
        let data = package(&bodies, descriptors);
        let whole = run(&data, &[]);
        let split = run(&data, &chunk_sizes);

        prop_assert_eq!(&whole.result, &Ok(UpdateResult::Pending));
        prop_assert_eq!(whole.state, UpdateState::WriteFinished);
        prop_assert_eq!(&split.result, &whole.result);
        prop_assert_eq!(split.state, whole.state);
        prop_assert_eq!(&split.files, &whole.files);
        prop_assert_eq!(whole.files.len(), bodies.len());
    }

    #[test]
    fn prop_body_corruption_is_detected(
        body in prop::collection::vec(any::<u8>(), 1..2048),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let built = PackageBuilder::new(json!({
            "platform": "esp32",
            "version": "2.0.0",
            "build_id": "b2",
            "parts": {"app": {"src": "fw.bin"}}
        }))
        .entry("fw.bin", &body)
        .build_package();

        let entry = built.entry("fw.bin").unwrap();
        let mut data = built.bytes.clone();
        data[entry.data_offset + index.index(entry.len)] ^= flip;

        let outcome = run(&data, &[]);
        let err = outcome.result.unwrap_err();
        let expected = UpdateError::ChecksumMismatch {
            name: "fw.bin".to_string(),
            expected: crate::checksum::crc32(&body),
            actual: 0,
        }
        .to_string();
        // Same message up to the computed value.
        let prefix = &expected[..expected.find("got").unwrap()];
        prop_assert!(err.starts_with(prefix), "unexpected error: {}", err);
        prop_assert_eq!(outcome.state, UpdateState::Finished);
    }

    #[test]
    fn prop_directory_prefix_is_stripped(prefix in arb_prefix(), body in arb_body()) {
        let data = PackageBuilder::new(json!({
            "platform": "esp32",
            "version": "2.0.0",
            "build_id": "b2",
            "parts": {"app": {"src": "fw.bin"}}
        }))
        .entry(&format!("{prefix}fw.bin"), &body)
        .build();

        let outcome = run(&data, &[]);
        prop_assert_eq!(outcome.files, vec![("fw.bin".to_string(), body)]);
    }
}
