//! Replaces registered secret values with `*`-filler of identical length.
//!
//! Filler and secret always have equal length, so concatenating every
//! buffered entry's text, scrubbing the concatenation, and re-slicing at
//! the original per-entry boundaries recovers scrubbed per-entry text even
//! when a secret straddles an entry boundary.

use std::collections::VecDeque;

use runner_core::log::LogEntry;
use runner_core::secret::SecretStore;

use crate::error::Result;
use crate::sequencer::Sequencer;

pub struct Scrubber {
    secrets: Vec<String>,
    max_secret_len: usize,
    pending: VecDeque<LogEntry>,
    pending_len: usize,
    next: Sequencer,
}

impl Scrubber {
    pub fn new(secrets: &SecretStore, next: Sequencer) -> Self {
        let values: Vec<String> = secrets.scrubbable_values().map(str::to_string).collect();
        let max_secret_len = values.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            secrets: values,
            max_secret_len,
            pending: VecDeque::new(),
            pending_len: 0,
            next,
        }
    }

    pub async fn write(&mut self, entry: LogEntry) -> Result<()> {
        let Some(text) = entry.text() else {
            self.flush_pending().await?;
            return self.next.write(entry).await;
        };

        self.pending_len += text.len();
        self.pending.push_back(entry);

        // Flush every entry that lies outside the trailing window; a
        // secret can never straddle the boundary of a flushed entry
        // because at least `max_secret_len` bytes remain buffered after it.
        //
        // Every entry flushed in this pass is sliced out of a single scrub
        // of the whole pending window, computed once before any entry is
        // popped. Re-scrubbing a shrunken window after each pop would lose
        // the trailing bytes that complete a match spanning more than two
        // entries, letting part of the secret through unscrubbed.
        if self.pending_len.saturating_sub(self.front_len()) >= self.max_secret_len {
            let scrubbed = self.scrub(&self.concatenated());
            let mut offset = 0;
            while self.pending_len.saturating_sub(self.front_len()) >= self.max_secret_len {
                offset = self.pop_front_scrubbed(&scrubbed, offset).await?;
            }
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.flush_pending().await?;
        self.next.flush().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.flush_pending().await?;
        self.next.close().await
    }

    fn front_len(&self) -> usize {
        self.pending.front().and_then(|e| e.text()).map(str::len).unwrap_or(0)
    }

    fn concatenated(&self) -> String {
        self.pending.iter().filter_map(|e| e.text()).collect()
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let scrubbed = self.scrub(&self.concatenated());
        let mut offset = 0;
        while !self.pending.is_empty() {
            offset = self.pop_front_scrubbed(&scrubbed, offset).await?;
        }
        Ok(())
    }

    /// Pops the front entry and hands it downstream with its slice
    /// `scrubbed[offset..offset + front_len]`, returning the next offset.
    async fn pop_front_scrubbed(&mut self, scrubbed: &str, offset: usize) -> Result<usize> {
        let front = self.pending.pop_front().expect("checked non-empty");
        let front_len = front.text().map(str::len).unwrap_or(0);
        self.pending_len -= front_len;

        self.next
            .write(front.with_text(scrubbed[offset..offset + front_len].to_string()))
            .await?;
        Ok(offset + front_len)
    }

    fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if secret.is_empty() {
                continue;
            }
            let filler: String = std::iter::repeat('*').take(secret.len()).collect();
            out = out.replace(secret.as_str(), &filler);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_buffer::FileBuffer;
    use proptest::prelude::*;
    use runner_core::log::LogDescriptor;
    use runner_core::secret::Secret;
    use runner_core::ResourceId;

    async fn sequencer_to_disk() -> (Sequencer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: ResourceId::new(),
            step_id: None,
        };
        let fb = FileBuffer::start(descriptor, dir.path(), None).await.unwrap();
        (Sequencer::new(fb), dir)
    }

    /// Runs `entries` through a `Scrubber` backed by a real `Sequencer`/
    /// `FileBuffer`, then reads the delivered text of each entry back off
    /// disk in order, so tests exercise the exact same windowing code path
    /// production traffic does rather than a reimplementation of it.
    async fn scrub_all(secrets: Vec<Secret>, entries: &[&str]) -> Vec<String> {
        let store = SecretStore::new(secrets);
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: ResourceId::new(),
            step_id: None,
        };
        let path = dir.path().join(format!("{}.log", descriptor.id));
        let fb = FileBuffer::start(descriptor, dir.path(), None).await.unwrap();
        let sequencer = Sequencer::new(fb);
        let mut scrubber = Scrubber::new(&store, sequencer);

        for text in entries {
            scrubber.write(LogEntry::line(*text)).await.unwrap();
        }
        scrubber.flush().await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<LogEntry> = serde_json::from_str(&format!("{raw}]")).unwrap();
        scrubber.close().await.unwrap();

        parsed.into_iter().map(|e| e.text().unwrap().to_string()).collect()
    }

    fn secret(value: &str) -> Secret {
        Secret {
            id: ResourceId::new(),
            name: "SECRET".into(),
            value: value.into(),
            is_internal: false,
        }
    }

    #[tokio::test]
    async fn scrubs_registered_secret_with_equal_length_filler() {
        let store = SecretStore::new(vec![Secret {
            id: ResourceId::new(),
            name: "TOKEN".into(),
            value: "sekret".into(),
            is_internal: false,
        }]);
        let (sequencer, _dir) = sequencer_to_disk().await;
        let mut scrubber = Scrubber::new(&store, sequencer);
        scrubber
            .write(LogEntry::line("token is sekret here"))
            .await
            .unwrap();
        scrubber.close().await.unwrap();
    }

    #[tokio::test]
    async fn internal_secrets_are_not_scrubbed() {
        let store = SecretStore::new(vec![Secret {
            id: ResourceId::new(),
            name: "INTERNAL".into(),
            value: "internalvalue".into(),
            is_internal: true,
        }]);
        let (sequencer, _dir) = sequencer_to_disk().await;
        let scrubber = Scrubber::new(&store, sequencer);
        assert!(scrubber.secrets.is_empty());
    }

    #[test]
    fn filler_preserves_length_so_boundaries_stay_aligned() {
        let store = SecretStore::new(vec![Secret {
            id: ResourceId::new(),
            name: "TOKEN".into(),
            value: "abc".into(),
            is_internal: false,
        }]);
        let scrubber_secrets: Vec<&str> = store.scrubbable_values().collect();
        let filler: String = std::iter::repeat('*').take(scrubber_secrets[0].len()).collect();
        assert_eq!(filler.len(), scrubber_secrets[0].len());
    }

    #[tokio::test]
    async fn secret_split_across_three_or_more_entries_is_fully_scrubbed() {
        let delivered = scrub_all(
            vec![secret("world")],
            &["Hello world", "Hello World", "wor", "ld", "helloworld", "hello\nworld"],
        )
        .await;

        assert_eq!(
            delivered,
            vec!["Hello *****", "Hello World", "***", "**", "hello*****", "hello\n*****"]
        );
    }

    proptest! {
        /// However a secret's bytes are split across entry boundaries, no
        /// delivered entry's text may contain the secret as a substring.
        #[test]
        fn delivered_text_never_contains_the_secret(
            pieces in prop::collection::vec("[a-z]{0,4}", 1..12),
            secret_value in "[a-z]{2,5}",
        ) {
            let entries: Vec<&str> = pieces.iter().map(String::as_str).collect();
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let delivered = rt.block_on(scrub_all(vec![secret(&secret_value)], &entries));

            for text in &delivered {
                prop_assert!(!text.contains(&secret_value));
            }
            // Scrubbing only ever substitutes equal-length filler, so the
            // concatenation's total length is unchanged.
            let original_len: usize = entries.iter().map(|e| e.len()).sum();
            let delivered_len: usize = delivered.iter().map(|e| e.len()).sum();
            prop_assert_eq!(original_len, delivered_len);
        }
    }
}
