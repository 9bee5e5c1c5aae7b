//! Secure log: sealed, chained records on top of a flash ring log
//!
//! The secure log owns the device key and the chain state. Appends seal the
//! entry under the current chain nonce, write it to the ring, and only then
//! advance and persist the chain. Drains read each record, check that its
//! nonce continues the drained chain, verify its tag and hand the plaintext
//! to a sink. The record is consumed only after the sink took it and the
//! drained position was persisted.
//!
//! Opening reconciles the persisted write position with the newest record on
//! flash, so a crash between the ring commit and the key material commit
//! never leads to a nonce being sealed twice.
//!
//! Any integrity failure (bad frame, bad tag, broken chain) or a failed flash
//! append resets the ring and the key together. History is lost, but the log
//! is left consistent and usable.

use crate::clock;
use crate::config::SecureLogConfig;
use crate::error::{LogError, Result};
use crate::flash::ring::{FlashRingLog, RingStats};
use crate::flash::{ControlBlock, FrameHeader};
use crate::secure::cipher::RecordCipher;
use crate::secure::sink::{RecordSink, VerifiedRecord};
use crate::secure::{KeyMaterial, SecureRecord, KEY_SIZE, NONCE_SIZE, RECORD_OVERHEAD};
use crate::storage::{BlockStore, MetaStore, PartitionTable};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::sync::Arc;
use zeroize::Zeroize;

const TARGET: &str = "log_secure";

struct ChainState {
    material: KeyMaterial,
    cipher: RecordCipher,
    resets: u64,
}

impl ChainState {
    fn new(material: KeyMaterial) -> Self {
        let cipher = RecordCipher::new(&material.key);
        Self {
            material,
            cipher,
            resets: 0,
        }
    }
}

/// Tamper-evident log of text entries
pub struct SecureLog<B: BlockStore, M: MetaStore> {
    config: SecureLogConfig,
    ring: FlashRingLog<B, M>,
    meta: Arc<M>,
    clock: Box<dyn Fn() -> u32 + Send + Sync>,
    chain: Mutex<ChainState>,
}

impl<B: BlockStore, M: MetaStore> SecureLog<B, M> {
    /// Bind the configured region and load, or create, the device key
    pub fn open<P>(partitions: &P, meta: Arc<M>, config: SecureLogConfig) -> Result<Self>
    where
        P: PartitionTable<Region = B>,
    {
        let ring = FlashRingLog::open(partitions, meta.clone(), config.ring.clone())?;
        Self::with_ring(ring, meta, config)
    }

    /// Use an already bound region
    pub fn with_store(store: B, meta: Arc<M>, config: SecureLogConfig) -> Result<Self> {
        let ring = FlashRingLog::with_store(store, meta.clone(), config.ring.clone())?;
        Self::with_ring(ring, meta, config)
    }

    fn with_ring(ring: FlashRingLog<B, M>, meta: Arc<M>, config: SecureLogConfig) -> Result<Self> {
        let record_len = config.max_plaintext_len + RECORD_OVERHEAD;
        if config.max_plaintext_len == 0 || record_len > ring.max_payload_len() {
            return Err(LogError::InvalidSize {
                size: record_len + FrameHeader::SIZE,
                capacity: ring.region_size(),
            });
        }

        let material = match meta.get_blob(&config.key_namespace, &config.key_blob)? {
            Some(blob) => match KeyMaterial::decode(&blob) {
                Ok(mut material) => {
                    debug!(target: TARGET, "loaded key material. chain={}", hex::encode(material.chain));
                    match resume_chain(&ring, &mut material) {
                        Ok(false) => material,
                        Ok(true) => {
                            save_material(meta.as_ref(), &config, &material)?;
                            material
                        }
                        Err(e) if e.is_integrity_failure() => {
                            warn!(target: TARGET, "stored records are unreadable ({}). resetting log and key", e);
                            ring.reset_metadata()?;
                            create_material(meta.as_ref(), &config)?
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!(target: TARGET, "key material unreadable ({}). resetting log and key", e);
                    ring.reset_metadata()?;
                    create_material(meta.as_ref(), &config)?
                }
            },
            None => {
                debug!(target: TARGET, "detected first boot. generating aead key");
                if ring.control_block().head != 0 {
                    // Records sealed under a lost key can never be verified or continued
                    warn!(target: TARGET, "ring holds records but no key exists. erasing them");
                    ring.reset_metadata()?;
                }
                create_material(meta.as_ref(), &config)?
            }
        };

        Ok(Self {
            config,
            ring,
            meta,
            clock: Box::new(clock::uptime_ms),
            chain: Mutex::new(ChainState::new(material)),
        })
    }

    /// Replace the timestamp source
    pub fn with_clock(mut self, clock: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Cursor positions and usage of the underlying ring
    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }

    /// Copy of the underlying ring's control block
    pub fn control_block(&self) -> ControlBlock {
        self.ring.control_block()
    }

    /// Check whether every written record has been drained
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of integrity resets since this instance was opened
    pub fn reset_count(&self) -> u64 {
        self.chain.lock().resets
    }

    /// Nonce the next appended record will be sealed with
    pub fn next_nonce(&self) -> [u8; NONCE_SIZE] {
        self.chain.lock().material.chain
    }

    /// Append `message` formatted as `"<timestamp> [<tag>]: <message>\n"`
    ///
    /// Messages longer than the record buffer are truncated silently. Fails
    /// with [`LogError::InvalidArgument`] if even the prefix does not fit.
    pub fn append_log_entry(&self, tag: &str, message: &str) -> Result<()> {
        let timestamp = (self.clock)();
        let plaintext = format_entry(timestamp, tag, message, self.config.max_plaintext_len)?;
        self.seal_and_append(timestamp, &plaintext)
    }

    /// Append caller-formatted text, adding the trailing newline
    ///
    /// Text longer than the record buffer is truncated silently.
    pub fn append(&self, text: &str) -> Result<()> {
        let timestamp = (self.clock)();
        let mut plaintext = truncate(text, self.config.max_plaintext_len - 1).as_bytes().to_vec();
        plaintext.push(b'\n');
        self.seal_and_append(timestamp, &plaintext)
    }

    fn seal_and_append(&self, timestamp: u32, plaintext: &[u8]) -> Result<()> {
        let mut chain = self.chain.lock();

        let record = chain.cipher.seal(&chain.material.chain, timestamp, plaintext)?;
        let discarded_before = self.ring.stats().discarded_bytes;

        if let Err(e) = self.ring.append(&record.encode()) {
            error!(target: TARGET, "flash write failed ({}), resetting log", e);
            self.reset_locked(&mut chain)?;
            return Err(e);
        }

        if self.ring.stats().discarded_bytes != discarded_before {
            // Unread records were erased by a wrap; the drain resumes at this one
            chain.material.verified = record.nonce;
        }

        chain.material.chain = record.next_nonce();
        debug!(target: TARGET, "logged secure entry. ts={} len={}", timestamp, plaintext.len());

        self.persist_material(&chain.material)
    }

    /// Drain every stored record into `sink`, returning how many were emitted
    ///
    /// A record is consumed once the sink accepted it. On any integrity
    /// failure the log and key are reset and the failure is returned; records
    /// after the failure point are never emitted. A sink error leaves the
    /// failed record in place for the next drain.
    ///
    /// Power loss in the middle of a drain may emit the last record twice,
    /// never zero times.
    pub fn drain_and_emit(&self, sink: &mut dyn RecordSink) -> Result<usize> {
        let mut chain = self.chain.lock();
        debug!(target: TARGET, "dumping secure logs...");

        sink.begin()?;
        let mut emitted = 0;

        loop {
            let step = self
                .ring
                .read_next_record_with(|sealed| self.verify_and_emit(&mut chain, sealed, &mut *sink));

            match step {
                Ok(Some(())) => emitted += 1,
                Ok(None) => break,
                Err(e) if e.is_integrity_failure() => {
                    error!(target: TARGET, "error dumping logs ({}). resetting log", e);
                    self.reset_locked(&mut chain)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        sink.end()?;
        Ok(emitted)
    }

    fn verify_and_emit(&self, chain: &mut ChainState, sealed: Vec<u8>, sink: &mut dyn RecordSink) -> Result<()> {
        let record = SecureRecord::decode(&sealed)?;
        let expected = chain.material.verified;

        // A record whose successor nonce is already marked drained was emitted
        // before power was lost, but never consumed
        let repeated = record.nonce != expected && record.next_nonce() == expected;
        if record.nonce != expected && !repeated {
            return Err(LogError::Crypto("nonce chain broken"));
        }

        let plaintext = chain.cipher.open(&record)?;
        if repeated {
            info!(target: TARGET, "re-emitting record drained before power loss. ts={}", record.timestamp);
        }

        sink.emit(&VerifiedRecord {
            timestamp: record.timestamp,
            plaintext,
            sealed,
        })?;

        if !repeated {
            chain.material.verified = record.next_nonce();
            if let Err(e) = self.persist_material(&chain.material) {
                chain.material.verified = expected;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Erase all records and replace the key with a fresh one
    pub fn reset(&self) -> Result<()> {
        let mut chain = self.chain.lock();
        self.reset_locked(&mut chain)
    }

    fn reset_locked(&self, chain: &mut ChainState) -> Result<()> {
        warn!(target: TARGET, "resetting secure log and key material");

        self.ring.reset_metadata()?;
        self.meta.erase_key(&self.config.key_namespace, &self.config.key_blob)?;
        self.meta.commit(&self.config.key_namespace)?;

        let material = create_material(self.meta.as_ref(), &self.config)?;
        let resets = chain.resets + 1;
        *chain = ChainState::new(material);
        chain.resets = resets;
        Ok(())
    }

    fn persist_material(&self, material: &KeyMaterial) -> Result<()> {
        save_material(self.meta.as_ref(), &self.config, material)
    }
}

fn save_material<M: MetaStore + ?Sized>(meta: &M, config: &SecureLogConfig, material: &KeyMaterial) -> Result<()> {
    let mut blob = material.encode();
    let result = meta.set_blob(&config.key_namespace, &config.key_blob, &blob);
    blob.zeroize();
    result?;
    meta.commit(&config.key_namespace)?;
    Ok(())
}

fn create_material<M: MetaStore + ?Sized>(meta: &M, config: &SecureLogConfig) -> Result<KeyMaterial> {
    let mut material = KeyMaterial::new([0u8; KEY_SIZE], [0u8; NONCE_SIZE]);

    OsRng
        .try_fill_bytes(&mut material.key)
        .and_then(|_| OsRng.try_fill_bytes(&mut material.chain))
        .map_err(|_| LogError::Crypto("secure random source unavailable"))?;
    material.verified = material.chain;

    save_material(meta, config, &material)?;
    Ok(material)
}

/// Continue the write chain after the newest record on flash
///
/// The ring commits a record before its key material is saved, so after
/// power loss the persisted chain can lag one record behind. Returns whether
/// `material` was changed.
fn resume_chain<B: BlockStore, M: MetaStore>(ring: &FlashRingLog<B, M>, material: &mut KeyMaterial) -> Result<bool> {
    let last = match ring.last_record()? {
        Some(last) => SecureRecord::decode(&last)?,
        None => return Ok(false),
    };

    let next = last.next_nonce();
    if material.chain == next {
        return Ok(false);
    }

    warn!(
        target: TARGET,
        "persisted chain lags flash. resuming after record ts={}", last.timestamp
    );
    material.chain = next;
    Ok(true)
}

/// Build the plaintext of an entry, truncating the message to fit `max_len`
pub fn format_entry(timestamp: u32, tag: &str, message: &str, max_len: usize) -> Result<Vec<u8>> {
    let prefix = format!("{:>10} [{}]: ", timestamp, tag);
    if prefix.len() + 1 > max_len {
        return Err(LogError::InvalidArgument("entry prefix exceeds record buffer"));
    }

    let body = truncate(message, max_len - 1 - prefix.len());

    let mut out = Vec::with_capacity(prefix.len() + body.len() + 1);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.push(b'\n');
    Ok(out)
}

fn truncate(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
