//! Deterministic fingerprint hasher combining a job-config hash, a
//! name-sorted list of dependency fingerprints, and the stdout of the
//! job's fingerprint commands.
//!
//! Dependency order is a correctness requirement: the same set of inputs
//! must hash to the same digest on every runner, so dependencies are
//! always sorted by name before being folded in.

use std::io::{self, Write};

use blake2::{Blake2b512, Digest};
use runner_core::artifact::HashKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash_kind: HashKind,
    pub digest: String,
}

/// A streaming hasher. Construct it with the job-config hash and the
/// dependency fingerprints up front, then feed fingerprint-command stdout
/// through `Write` as each command runs, and call [`finalize`](Self::finalize)
/// once all commands have completed.
pub struct FingerprintHasher {
    hasher: Blake2b512,
}

impl FingerprintHasher {
    pub fn new(job_config_hash: &str, dependencies: &[(String, String)]) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(job_config_hash.as_bytes());
        hasher.update([0u8]);

        let mut sorted: Vec<&(String, String)> = dependencies.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, fingerprint) in sorted {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(fingerprint.as_bytes());
            hasher.update([0u8]);
        }

        Self { hasher }
    }

    pub fn finalize(self) -> Fingerprint {
        let digest = self.hasher.finalize();
        Fingerprint {
            hash_kind: HashKind::Blake2b,
            digest: hex::encode(digest),
        }
    }
}

impl Write for FingerprintHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_for(deps: &[(String, String)], stdout: &[u8]) -> String {
        let mut hasher = FingerprintHasher::new("job-hash", deps);
        hasher.write_all(stdout).unwrap();
        hasher.finalize().digest
    }

    #[test]
    fn dependency_order_does_not_affect_digest() {
        let a = ("a".to_string(), "1".to_string());
        let b = ("b".to_string(), "2".to_string());

        let forward = digest_for(&[a.clone(), b.clone()], b"abc\n");
        let reversed = digest_for(&[b, a], b"abc\n");

        assert_eq!(forward, reversed);
    }

    #[test]
    fn different_stdout_yields_different_digest() {
        let d1 = digest_for(&[], b"abc\n");
        let d2 = digest_for(&[], b"xyz\n");
        assert_ne!(d1, d2);
    }

    #[test]
    fn different_job_config_hash_yields_different_digest() {
        let mut h1 = FingerprintHasher::new("job-hash-a", &[]);
        h1.write_all(b"abc\n").unwrap();
        let mut h2 = FingerprintHasher::new("job-hash-b", &[]);
        h2.write_all(b"abc\n").unwrap();
        assert_ne!(h1.finalize().digest, h2.finalize().digest);
    }

    #[test]
    fn finalize_reports_blake2b() {
        let hasher = FingerprintHasher::new("job-hash", &[]);
        assert_eq!(hasher.finalize().hash_kind, HashKind::Blake2b);
    }
}
