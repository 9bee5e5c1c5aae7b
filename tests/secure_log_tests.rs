//! Tests for the secure log: chain integrity, tamper evidence and recovery

use flashlog::types::{FrameHeader, KeyMaterial, RecordCipher, SecureRecord};
use flashlog::{
    HexLineSink, LogError, MemoryBlockStore, MemoryMetaStore, MemoryPartitionTable, MetaStore,
    RecordSink, SecureLog, SecureLogConfig, VerifiedRecord,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

type MemorySecureLog = SecureLog<MemoryBlockStore, MemoryMetaStore>;

struct TestContext {
    table: MemoryPartitionTable,
    region: MemoryBlockStore,
    meta: MemoryMetaStore,
}

impl TestContext {
    fn new() -> Self {
        let table = MemoryPartitionTable::new();
        let region = table.add_region("log_secure", 4096);

        Self {
            table,
            region,
            meta: MemoryMetaStore::new(),
        }
    }

    fn open(&self) -> MemorySecureLog {
        let ticks = Arc::new(AtomicU32::new(1000));
        SecureLog::open(&self.table, Arc::new(self.meta.clone()), SecureLogConfig::default())
            .unwrap()
            .with_clock(move || ticks.fetch_add(10, Ordering::SeqCst))
    }

    fn key(&self) -> KeyMaterial {
        let blob = self.meta.get_blob("log_secure_nvs", "meta").unwrap().unwrap();
        KeyMaterial::decode(&blob).unwrap()
    }

    /// Offsets and decoded records of every frame currently on flash
    fn frames(&self) -> Vec<(usize, SecureRecord)> {
        let bytes = self.region.snapshot();
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos + FrameHeader::SIZE <= bytes.len() {
            let mut raw = [0u8; FrameHeader::SIZE];
            raw.copy_from_slice(&bytes[pos..pos + FrameHeader::SIZE]);
            let header = FrameHeader::decode(&raw);
            if !header.is_valid() {
                break;
            }

            let start = pos + FrameHeader::SIZE;
            let record = SecureRecord::decode(&bytes[start..start + header.len as usize]).unwrap();
            frames.push((pos, record));
            pos += header.frame_len();
        }

        frames
    }

    /// Replace the frame at `offset` with `record`, recomputing its checksum
    fn forge_frame(&self, offset: usize, record: &SecureRecord) {
        let payload = record.encode();
        self.region.overwrite(offset, &FrameHeader::for_payload(&payload).encode());
        self.region.overwrite(offset + FrameHeader::SIZE, &payload);
    }
}

fn drain(log: &MemorySecureLog) -> (Result<usize, LogError>, Vec<VerifiedRecord>) {
    let mut sink: Vec<VerifiedRecord> = Vec::new();
    let result = log.drain_and_emit(&mut sink);
    (result, sink)
}

/// Entries drain in order with their formatted plaintext
#[test]
fn test_append_and_drain() {
    let context = TestContext::new();
    let log = context.open();

    log.append_log_entry("main", "system running smoothly. counter=0").unwrap();
    log.append_log_entry("main", "system running smoothly. counter=1").unwrap();
    log.append_log_entry("net", "link up").unwrap();

    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 3);

    let texts: Vec<String> = records.iter().map(|r| r.text()).collect();
    assert_eq!(
        texts,
        vec![
            "      1000 [main]: system running smoothly. counter=0\n",
            "      1010 [main]: system running smoothly. counter=1\n",
            "      1020 [net]: link up\n",
        ]
    );
    assert_eq!(records[2].timestamp, 1020);
    assert!(log.is_empty());
}

/// Draining a fresh log emits only the markers
#[test]
fn test_drain_empty_log() {
    let context = TestContext::new();
    let log = context.open();

    let mut sink = HexLineSink::sealed(Vec::new());
    assert_eq!(log.drain_and_emit(&mut sink).unwrap(), 0);
    assert_eq!(sink.into_inner(), b"log_dump:\nlog_dump_end:\n");
    assert!(log.is_empty());
    assert_eq!(log.reset_count(), 0);
}

/// Each record's nonce is the previous record's tag prefix
#[test]
fn test_nonce_chain_on_flash() {
    let context = TestContext::new();
    let log = context.open();
    let seed = context.key().chain;

    for i in 0..4 {
        log.append(&format!("entry {}", i)).unwrap();
    }

    let frames = context.frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].1.nonce, seed);
    for pair in frames.windows(2) {
        assert_eq!(pair[1].1.nonce, pair[0].1.next_nonce());
    }

    // Persisted chain state points past the last record
    assert_eq!(context.key().chain, frames[3].1.next_nonce());
}

/// A host holding the key can verify the sealed hex dump on its own
#[test]
fn test_hex_dump_verifiable_offline() {
    let context = TestContext::new();
    let log = context.open();
    let material = context.key();

    log.append("first").unwrap();
    log.append("second").unwrap();

    let mut sink = HexLineSink::sealed(Vec::new());
    log.drain_and_emit(&mut sink).unwrap();
    let dump = String::from_utf8(sink.into_inner()).unwrap();

    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.first(), Some(&"log_dump:"));
    assert_eq!(lines.last(), Some(&"log_dump_end:"));
    assert_eq!(lines.len(), 4);

    let cipher = RecordCipher::new(&material.key);
    let mut nonce = material.chain;
    let mut texts = Vec::new();
    for line in &lines[1..3] {
        let record = SecureRecord::decode(&hex::decode(line).unwrap()).unwrap();
        assert_eq!(record.nonce, nonce);
        texts.push(String::from_utf8(cipher.open(&record).unwrap()).unwrap());
        nonce = record.next_nonce();
    }
    assert_eq!(texts, vec!["first\n", "second\n"]);
}

/// Altering r1 on flash (checksum left stale) halts the drain before r2
#[test]
fn test_tampered_record_checksum() {
    let context = TestContext::new();
    let log = context.open();

    log.append("r1").unwrap();
    log.append("r2").unwrap();

    let (offset, _) = context.frames()[0];
    context.region.flip_bits(offset + FrameHeader::SIZE + 16, 0x01);

    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::InvalidChecksum { .. })));
    assert!(records.is_empty());

    // Full reset: empty log, fresh key
    assert!(log.is_empty());
    assert_eq!(log.reset_count(), 1);
}

/// Altering r1's ciphertext with a recomputed checksum fails r1's tag
#[test]
fn test_tampered_ciphertext_forged_checksum() {
    let context = TestContext::new();
    let log = context.open();
    let old_key = context.key().key;

    log.append("r1").unwrap();
    log.append("r2").unwrap();

    let (offset, mut r1) = context.frames()[0].clone();
    r1.ciphertext[0] ^= 0x20;
    context.forge_frame(offset, &r1);

    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::Crypto(_))));
    assert!(records.is_empty(), "r2 must never be emitted");

    assert!(log.is_empty());
    assert_ne!(context.key().key, old_key);
}

/// Altering r1's tag breaks the chain even though r2's bytes are intact
#[test]
fn test_tampered_tag_forged_checksum() {
    let context = TestContext::new();
    let log = context.open();

    log.append("r1").unwrap();
    log.append("r2").unwrap();

    let (offset, mut r1) = context.frames()[0].clone();
    r1.tag[0] ^= 0xFF;
    context.forge_frame(offset, &r1);

    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::Crypto(_))));
    assert!(records.is_empty());
}

/// Removing a record from the middle of the chain is detected
#[test]
fn test_deleted_record_detected() {
    let context = TestContext::new();
    let log = context.open();

    log.append("r1").unwrap();
    log.append("r2").unwrap();
    log.append("r3").unwrap();

    // Move r3 into r2's slot so the flash holds r1, r3
    let frames = context.frames();
    let (r2_offset, _) = frames[1];
    let r3 = frames[2].1.clone();
    context.region.overwrite(r2_offset, &vec![0xFF; 4096 - r2_offset]);
    context.forge_frame(r2_offset, &r3);

    // Point head at the end of the spliced frame
    let mut control = log.control_block();
    control.head = (r2_offset + FrameHeader::SIZE + r3.encoded_len()) as u32;
    control.update_crc();
    context.meta.set_blob("rb_log", "log_secure", &control.encode()).unwrap();
    drop(log);

    let log = context.open();
    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::Crypto("nonce chain broken"))));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text(), "r1\n");
}

/// Swapping two records is detected
#[test]
fn test_reordered_records_detected() {
    let context = TestContext::new();
    let log = context.open();

    log.append("aa").unwrap();
    log.append("bb").unwrap();

    let frames = context.frames();
    let (first_offset, first) = frames[0].clone();
    let (second_offset, second) = frames[1].clone();
    context.forge_frame(first_offset, &second);
    context.forge_frame(second_offset, &first);

    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::Crypto(_))));
    assert!(records.len() <= 1);
    assert!(log.is_empty());
}

/// The chain survives reopening, and new records continue it
#[test]
fn test_chain_survives_reopen() {
    let context = TestContext::new();
    {
        let log = context.open();
        log.append("before reboot").unwrap();
    }

    let log = context.open();
    log.append("after reboot").unwrap();

    let frames = context.frames();
    assert_eq!(frames[1].1.nonce, frames[0].1.next_nonce());

    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 2);
    assert_eq!(records[0].text(), "before reboot\n");
    assert_eq!(records[1].text(), "after reboot\n");
}

/// A lost key makes the stored records unusable, so they are discarded
#[test]
fn test_missing_key_discards_records() {
    let context = TestContext::new();
    {
        let log = context.open();
        log.append("orphaned").unwrap();
    }

    context.meta.erase_key("log_secure_nvs", "meta").unwrap();

    let log = context.open();
    assert!(log.is_empty());
    assert_eq!(drain(&log).0.unwrap(), 0);
}

/// Oversized messages are truncated to the record buffer
#[test]
fn test_long_message_truncated() {
    let context = TestContext::new();
    let log = context.open();

    log.append_log_entry("main", &"y".repeat(1000)).unwrap();

    let (_, records) = drain(&log);
    assert_eq!(records[0].plaintext.len(), 256);
    assert!(records[0].text().ends_with("yyy\n"));
}

/// Explicit reset wipes records and rotates the key
#[test]
fn test_explicit_reset() {
    let context = TestContext::new();
    let log = context.open();
    let before = context.key();

    log.append("gone").unwrap();
    log.reset().unwrap();

    let after = context.key();
    assert!(log.is_empty());
    assert_ne!(before.key, after.key);
    assert_eq!(log.next_nonce(), after.chain);
}

/// Wrapping over unread records restarts the verified chain cleanly
#[test]
fn test_wrap_with_unread_records() {
    let context = TestContext::new();
    let log = context.open();

    // Drain one record so the wrap starts from a drained chain position
    log.append("warmup").unwrap();
    assert_eq!(drain(&log).0.unwrap(), 1);

    // Fill past the region end without draining
    let message = "z".repeat(200);
    for _ in 0..20 {
        log.append(&message).unwrap();
    }
    assert!(log.stats().cycle >= 1);
    assert!(log.stats().discarded_bytes > 0);

    let (result, records) = drain(&log);
    assert!(result.unwrap() > 0);
    assert!(records.iter().all(|r| r.plaintext.len() == 201));
    assert_eq!(log.reset_count(), 0);
}

/// Concurrent producers share one chain without nonce reuse
#[test]
fn test_concurrent_producers() {
    let context = TestContext::new();
    let log = Arc::new(context.open());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let log = log.clone();
            thread::spawn(move || {
                for n in 0..5 {
                    log.append_log_entry(&format!("task{}", t), &format!("n={}", n)).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let frames = context.frames();
    assert_eq!(frames.len(), 20);
    for pair in frames.windows(2) {
        assert_eq!(pair[1].1.nonce, pair[0].1.next_nonce());
    }

    let (result, _) = drain(&log);
    assert_eq!(result.unwrap(), 20);
}

/// Sink that accepts `limit` records and then reports a broken transport
struct LimitedSink {
    limit: usize,
    records: Vec<VerifiedRecord>,
}

impl LimitedSink {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            records: Vec::new(),
        }
    }
}

impl RecordSink for LimitedSink {
    fn emit(&mut self, record: &VerifiedRecord) -> std::io::Result<()> {
        if self.records.len() == self.limit {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "uart gone"));
        }
        self.records.push(record.clone());
        Ok(())
    }
}

/// A failing sink surfaces its error without a reset or a lost record
#[test]
fn test_sink_failure_is_not_a_reset() {
    let context = TestContext::new();
    let log = context.open();
    log.append("one").unwrap();
    log.append("two").unwrap();

    assert!(matches!(log.drain_and_emit(&mut LimitedSink::new(0)), Err(LogError::Io(_))));
    assert_eq!(log.reset_count(), 0);
    assert!(!log.is_empty());

    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 2);
    assert_eq!(records[0].text(), "one\n");
    assert_eq!(records[1].text(), "two\n");
}

/// Losing the key material update after an append must not reuse a nonce
#[test]
fn test_stale_key_material_resumes_chain() {
    let context = TestContext::new();
    {
        let log = context.open();
        log.append("first").unwrap();
        let saved = context.meta.get_blob("log_secure_nvs", "meta").unwrap().unwrap();
        log.append("second").unwrap();

        // Power lost after the ring commit, before the key material commit
        context.meta.set_blob("log_secure_nvs", "meta", &saved).unwrap();
    }

    let log = context.open();
    let frames = context.frames();
    assert_eq!(log.next_nonce(), frames[1].1.next_nonce());
    assert_eq!(context.key().chain, frames[1].1.next_nonce());

    log.append("third").unwrap();

    let frames = context.frames();
    assert_eq!(frames.len(), 3);
    assert_ne!(frames[2].1.nonce, frames[1].1.nonce);
    assert_eq!(frames[2].1.nonce, frames[1].1.next_nonce());

    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 3);
    let texts: Vec<String> = records.iter().map(|r| r.text()).collect();
    assert_eq!(texts, vec!["first\n", "second\n", "third\n"]);
    assert_eq!(log.reset_count(), 0);
}

/// Skipping undrained records by moving the tail is caught on the next boot
#[test]
fn test_skipped_records_detected_after_reboot() {
    let context = TestContext::new();
    {
        let log = context.open();
        log.append("r1").unwrap();
        log.append("r2").unwrap();
        log.append("r3").unwrap();

        // Move the tail past r1 with a valid control block checksum
        let mut control = log.control_block();
        control.tail = context.frames()[1].0 as u32;
        control.update_crc();
        context.meta.set_blob("rb_log", "log_secure", &control.encode()).unwrap();
    }

    let log = context.open();
    let (result, records) = drain(&log);
    assert!(matches!(result, Err(LogError::Crypto("nonce chain broken"))));
    assert!(records.is_empty());
    assert_eq!(log.reset_count(), 1);
}

/// The drained position persists, so a later boot keeps checking the chain
#[test]
fn test_drained_position_survives_reboot() {
    let context = TestContext::new();
    {
        let log = context.open();
        log.append("early").unwrap();
        assert_eq!(drain(&log).0.unwrap(), 1);
        log.append("late").unwrap();
    }

    let frames = context.frames();
    assert_eq!(context.key().verified, frames[1].1.nonce);

    let log = context.open();
    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 1);
    assert_eq!(records[0].text(), "late\n");
    assert_eq!(context.key().verified, frames[1].1.next_nonce());
}

/// Power loss after a record was emitted but before it was consumed re-emits it
#[test]
fn test_interrupted_drain_emits_again() {
    let context = TestContext::new();
    let saved_control;
    {
        let log = context.open();
        log.append("one").unwrap();
        log.append("two").unwrap();
        saved_control = context.meta.get_blob("rb_log", "log_secure").unwrap().unwrap();

        let mut sink = LimitedSink::new(1);
        assert!(matches!(log.drain_and_emit(&mut sink), Err(LogError::Io(_))));
        assert_eq!(sink.records.len(), 1);
    }

    // The drained position was saved, the tail update was not
    context.meta.set_blob("rb_log", "log_secure", &saved_control).unwrap();

    let log = context.open();
    let (result, records) = drain(&log);
    assert_eq!(result.unwrap(), 2);
    assert_eq!(records[0].text(), "one\n");
    assert_eq!(records[1].text(), "two\n");
    assert_eq!(log.reset_count(), 0);
}
